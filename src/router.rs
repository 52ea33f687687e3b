use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::candidates::CandidateBuffer;
use crate::errors::CallError;
use crate::logging;
use crate::peerlink::{
    LinkEvent, LinkEventSink, MediaSource, PeerLinkEvent, PeerLinkFactory, RemoteTrack,
};
use crate::registry::{OfferDisposition, RegistrationState, SessionRegistry};
use crate::relay::{ChannelStatus, RelayEvent, RelaySink};
use crate::relayproto::RelayMessage;
use crate::session::{LinkOutcome, NegotiationState};

/// What the caller-facing layer is told.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StatusChanged(ChannelStatus),
    Registered { identity: String },
    RegistrationFailed(CallError),
    IncomingCall { from: String },
    Connected { remote: String },
    RemoteTrack { remote: String, track: RemoteTrack },
    Closed { remote: String },
    CallFailed { remote: String, reason: CallError },
    RelayError { code: String, message: String },
}

/// Routes relay frames to sessions and session output back to the relay.
///
/// Every handler runs to completion before the next event is taken, so a
/// session never sees two events interleaved mid-transition.
pub struct SignalingRouter {
    registry: SessionRegistry,
    relay: Arc<dyn RelaySink>,
    links: Arc<dyn PeerLinkFactory>,
    media: Arc<dyn MediaSource>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    events: mpsc::UnboundedSender<CallEvent>,
    channel: ChannelStatus,
}

impl SignalingRouter {
    pub fn new(
        relay: Arc<dyn RelaySink>,
        links: Arc<dyn PeerLinkFactory>,
        media: Arc<dyn MediaSource>,
        link_tx: mpsc::UnboundedSender<LinkEvent>,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            relay,
            links,
            media,
            link_tx,
            events,
            channel: ChannelStatus::Closed,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn channel_status(&self) -> ChannelStatus {
        self.channel
    }

    pub fn session_state(&self, remote: &str) -> Option<NegotiationState> {
        self.registry.get(remote).map(|s| s.state())
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, msg: &RelayMessage) -> Result<(), CallError> {
        logging::debug(format!("relay send type={}", msg.kind()));
        self.relay.send(msg)
    }

    fn local_identity(&self) -> Option<String> {
        self.registry.require_registered().ok().map(str::to_string)
    }

    pub fn register(&mut self, identity: &str) -> Result<(), CallError> {
        if identity.trim().is_empty() {
            return Err(CallError::InvalidTarget(identity.to_string()));
        }
        let reg = self.registry.registration();
        match (reg.state(), reg.identity()) {
            (RegistrationState::Registered, current) => {
                logging::debug(format!(
                    "register no-op requested={identity} registered={}",
                    current.unwrap_or_default()
                ));
                return Ok(());
            }
            (RegistrationState::Registering, Some(current)) if current == identity => {
                return Ok(());
            }
            (RegistrationState::Registering, current) => {
                return Err(CallError::RegistrationPending(
                    current.unwrap_or_default().to_string(),
                ));
            }
            (RegistrationState::Unregistered, _) => {}
        }
        if self.channel != ChannelStatus::Open {
            return Err(CallError::ChannelNotOpen);
        }
        self.registry.begin_registration(identity);
        if let Err(err) = self.send(&RelayMessage::Register {
            name: identity.to_string(),
        }) {
            self.registry.abort_registration();
            return Err(err);
        }
        logging::info_kv("registering", &[("identity", identity)]);
        Ok(())
    }

    pub async fn initiate_call(&mut self, remote: &str) -> Result<(), CallError> {
        let local = self.registry.require_registered()?.to_string();
        if self.registry.get(remote).is_some() {
            return Err(CallError::AlreadyInSession(remote.to_string()));
        }
        if self.channel != ChannelStatus::Open {
            return Err(CallError::ChannelNotOpen);
        }
        let session = self.registry.open_caller(remote)?;
        let sink = LinkEventSink::new(remote, session.generation(), self.link_tx.clone());
        logging::info_kv("calling", &[("remote", remote)]);
        let result = session
            .start_offer(self.links.as_ref(), self.media.as_ref(), sink)
            .await;
        let offer = match result {
            Ok(offer) => offer,
            Err(err) => {
                self.fail(remote, err.clone()).await;
                return Err(err);
            }
        };
        let msg = RelayMessage::Offer {
            from: local,
            to: remote.to_string(),
            offer,
        };
        if let Err(err) = self.send(&msg) {
            self.fail(remote, err.clone()).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn hangup(&mut self, remote: &str) -> Result<(), CallError> {
        let Some(mut session) = self.registry.evict(remote) else {
            return Err(CallError::NoSuchSession(remote.to_string()));
        };
        session.release(NegotiationState::Closed).await;
        logging::info_kv("hung up", &[("remote", remote)]);
        self.emit(CallEvent::Closed {
            remote: remote.to_string(),
        });
        Ok(())
    }

    pub async fn hangup_all(&mut self) {
        for remote in self.registry.remotes() {
            let _ = self.hangup(&remote).await;
        }
    }

    async fn fail(&mut self, remote: &str, reason: CallError) {
        let Some(mut session) = self.registry.evict(remote) else {
            return;
        };
        session.release(NegotiationState::Failed).await;
        logging::error(format!("call failed remote={remote} reason={reason}"));
        self.emit(CallEvent::CallFailed {
            remote: remote.to_string(),
            reason,
        });
    }

    async fn close(&mut self, remote: &str) {
        let Some(mut session) = self.registry.evict(remote) else {
            return;
        };
        session.release(NegotiationState::Closed).await;
        self.emit(CallEvent::Closed {
            remote: remote.to_string(),
        });
    }

    pub async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::StatusChanged(status) => self.on_status(status).await,
            RelayEvent::Message(msg) => self.handle_relay_message(msg).await,
        }
    }

    pub async fn handle_relay_message(&mut self, msg: RelayMessage) {
        logging::debug(format!("relay recv type={}", msg.kind()));
        match msg {
            RelayMessage::RegisterAck { success } => self.on_register_ack(success),
            RelayMessage::Offer { from, to, offer } => {
                if self.addressed_to_us(&from, &to, "offer") {
                    self.on_offer(&from, offer).await;
                }
            }
            RelayMessage::Answer { from, to, answer } => {
                if self.addressed_to_us(&from, &to, "answer") {
                    self.on_answer(&from, answer).await;
                }
            }
            RelayMessage::Candidate {
                from,
                to,
                candidate,
            } => {
                if self.addressed_to_us(&from, &to, "candidate") {
                    self.on_candidate(&from, candidate).await;
                }
            }
            RelayMessage::Error { code, message } => {
                logging::warn(format!("relay error code={code} message={message}"));
                self.emit(CallEvent::RelayError { code, message });
            }
            RelayMessage::Register { name } => {
                logging::warn(format!("ignoring register frame from relay name={name}"));
            }
        }
    }

    fn addressed_to_us(&self, from: &str, to: &str, kind: &str) -> bool {
        match self.local_identity() {
            Some(local) if local == to => true,
            Some(local) => {
                logging::warn(format!(
                    "dropping misrouted {kind} from={from} to={to} local={local}"
                ));
                false
            }
            None => {
                logging::warn(format!("dropping {kind} from={from}: not registered"));
                false
            }
        }
    }

    fn on_register_ack(&mut self, success: bool) {
        match self.registry.complete_registration(success) {
            Ok(Some(identity)) => {
                logging::info_kv("registered", &[("identity", &identity)]);
                self.emit(CallEvent::Registered { identity });
            }
            Ok(None) => logging::debug("register ack with nothing outstanding"),
            Err(err) => {
                logging::error(format!("registration failed: {err}"));
                self.emit(CallEvent::RegistrationFailed(err));
            }
        }
    }

    async fn on_offer(&mut self, from: &str, offer: Value) {
        let carried = match self.registry.classify_offer(from) {
            OfferDisposition::Accept => CandidateBuffer::new(),
            OfferDisposition::YieldToRemote => {
                logging::info_kv(
                    "glare: discarding own offer and answering",
                    &[("remote", from)],
                );
                match self.registry.evict(from) {
                    Some(mut own) => {
                        let carried = own.take_inbound();
                        own.release(NegotiationState::Closed).await;
                        carried
                    }
                    None => CandidateBuffer::new(),
                }
            }
            OfferDisposition::KeepOwnOffer => {
                logging::info_kv("glare: keeping own offer", &[("remote", from)]);
                return;
            }
            OfferDisposition::Unexpected => {
                logging::warn(CallError::UnexpectedOffer(from.to_string()).to_string());
                return;
            }
        };

        let session = match self.registry.open_callee(from, carried) {
            Ok(session) => session,
            Err(err) => {
                logging::warn(format!("cannot accept offer from={from}: {err}"));
                return;
            }
        };
        let local = session.local().to_string();
        let sink = LinkEventSink::new(from, session.generation(), self.link_tx.clone());
        let _ = self.events.send(CallEvent::IncomingCall {
            from: from.to_string(),
        });
        let result = session
            .accept_offer(offer, self.links.as_ref(), self.media.as_ref(), sink)
            .await;
        match result {
            Ok(answer) => {
                let msg = RelayMessage::Answer {
                    from: local,
                    to: from.to_string(),
                    answer,
                };
                if let Err(err) = self.send(&msg) {
                    self.fail(from, err).await;
                }
            }
            Err(err) => self.fail(from, err).await,
        }
    }

    async fn on_answer(&mut self, from: &str, answer: Value) {
        let Some(session) = self.registry.get_mut(from) else {
            if self.registry.was_released(from) {
                logging::debug(format!("answer for released session dropped from={from}"));
            } else {
                logging::warn(format!("answer without a session ignored from={from}"));
            }
            return;
        };
        if session.state() != NegotiationState::OfferSent {
            logging::warn(format!(
                "answer ignored from={from} state={}",
                session.state()
            ));
            return;
        }
        if let Err(err) = session.apply_answer(answer).await {
            self.fail(from, err).await;
        }
    }

    async fn on_candidate(&mut self, from: &str, candidate: Value) {
        match self.registry.get_mut(from) {
            Some(session) => session.add_remote_candidate(candidate).await,
            None => {
                if self.registry.hold_early_candidate(from, candidate) {
                    logging::debug(format!("early candidate held from={from}"));
                } else {
                    logging::debug(format!("candidate for released session dropped from={from}"));
                }
            }
        }
    }

    async fn on_status(&mut self, status: ChannelStatus) {
        self.channel = status;
        self.emit(CallEvent::StatusChanged(status));
        match status {
            ChannelStatus::Open => {
                if let Some(identity) = self.registry.restart_registration() {
                    logging::info_kv("re-registering after reconnect", &[("identity", &identity)]);
                    if let Err(err) = self.send(&RelayMessage::Register { name: identity }) {
                        logging::error(format!("re-register failed: {err}"));
                    }
                }
                self.flush_outbound();
            }
            ChannelStatus::Closed | ChannelStatus::Reconnecting => {
                for remote in self.registry.remotes() {
                    if self.session_state(&remote) != Some(NegotiationState::Connected) {
                        self.fail(&remote, CallError::RelayLost).await;
                    }
                }
            }
        }
    }

    fn flush_outbound(&mut self) {
        for remote in self.registry.remotes() {
            let Some(session) = self.registry.get_mut(&remote) else {
                continue;
            };
            let local = session.local().to_string();
            let mut pending = session.take_outbound().into_iter();
            while let Some(candidate) = pending.next() {
                let msg = RelayMessage::Candidate {
                    from: local.clone(),
                    to: remote.clone(),
                    candidate,
                };
                if self.relay.send(&msg).is_err() {
                    if let RelayMessage::Candidate { candidate, .. } = msg {
                        session.queue_outbound(candidate);
                    }
                    for rest in pending.by_ref() {
                        session.queue_outbound(rest);
                    }
                    break;
                }
            }
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            remote,
            generation,
            event,
        } = event;
        let Some(session) = self.registry.get_current(&remote, generation) else {
            logging::debug(format!(
                "stale peer link event dropped remote={remote} generation={generation}"
            ));
            return;
        };
        match event {
            PeerLinkEvent::LocalCandidate(Some(candidate)) => {
                if self.channel != ChannelStatus::Open {
                    session.queue_outbound(candidate);
                    return;
                }
                let msg = RelayMessage::Candidate {
                    from: session.local().to_string(),
                    to: remote.clone(),
                    candidate,
                };
                if let Err(err) = self.relay.send(&msg) {
                    logging::debug(format!("candidate queued remote={remote}: {err}"));
                    if let RelayMessage::Candidate { candidate, .. } = msg {
                        session.queue_outbound(candidate);
                    }
                }
            }
            PeerLinkEvent::LocalCandidate(None) => {
                logging::debug(format!("local candidate gathering complete remote={remote}"));
            }
            PeerLinkEvent::ConnectionState(state) => match session.on_link_state(state) {
                LinkOutcome::Unchanged => {}
                LinkOutcome::Connected => {
                    logging::info_kv("call connected", &[("remote", &remote)]);
                    self.emit(CallEvent::Connected { remote });
                }
                LinkOutcome::Failed => {
                    self.fail(
                        &remote,
                        CallError::PeerLinkFailed("connection failed".into()),
                    )
                    .await;
                }
                LinkOutcome::Closed => self.close(&remote).await,
            },
            PeerLinkEvent::RemoteTrack(track) => {
                logging::info_kv(
                    "remote track",
                    &[("remote", &remote), ("kind", &track.kind), ("id", &track.id)],
                );
                self.emit(CallEvent::RemoteTrack { remote, track });
            }
        }
    }
}
