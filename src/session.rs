use std::fmt;

use serde_json::Value;

use crate::candidates::CandidateBuffer;
use crate::errors::CallError;
use crate::logging;
use crate::peerlink::{LinkEventSink, MediaSource, PeerLink, PeerLinkFactory, PeerLinkState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a peer-link connection-state report means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Unchanged,
    Connected,
    Failed,
    Closed,
}

/// One call with one remote party. Owns its peer link and both candidate
/// buffers; every transition goes through the methods below.
pub struct Session {
    local: String,
    remote: String,
    role: Role,
    state: NegotiationState,
    generation: u64,
    link: Option<Box<dyn PeerLink>>,
    remote_description_set: bool,
    inbound: CandidateBuffer,
    outbound: CandidateBuffer,
}

impl Session {
    pub fn new(local: &str, remote: &str, role: Role, generation: u64) -> Self {
        Self {
            local: local.to_string(),
            remote: remote.to_string(),
            role,
            state: NegotiationState::Idle,
            generation,
            link: None,
            remote_description_set: false,
            inbound: CandidateBuffer::new(),
            outbound: CandidateBuffer::new(),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Candidates that arrived for this remote before the session existed.
    pub fn adopt_inbound(&mut self, early: CandidateBuffer) {
        self.inbound.extend(early);
    }

    /// Hands the unapplied inbound candidates to a successor session.
    pub fn take_inbound(&mut self) -> CandidateBuffer {
        std::mem::take(&mut self.inbound)
    }

    fn transition(&mut self, next: NegotiationState) {
        logging::info_kv(
            "session transition",
            &[
                ("remote", &self.remote),
                ("from", &self.state.to_string()),
                ("to", &next.to_string()),
            ],
        );
        self.state = next;
    }

    async fn acquire_link(
        &mut self,
        links: &dyn PeerLinkFactory,
        media: &dyn MediaSource,
        events: LinkEventSink,
    ) -> Result<(), CallError> {
        let link = links
            .create_link(events)
            .await
            .map_err(CallError::peer_link)?;
        // Store first so a media failure still closes the link on release.
        self.link = Some(link);
        let tracks = media.acquire_local_media().await?;
        self.link()?
            .add_local_media(&tracks)
            .await
            .map_err(CallError::peer_link)
    }

    fn link(&self) -> Result<&dyn PeerLink, CallError> {
        self.link
            .as_deref()
            .ok_or_else(|| CallError::PeerLinkFailed("peer link released".into()))
    }

    /// Caller side: Idle -> OfferSent. Returns the offer blob to send.
    pub async fn start_offer(
        &mut self,
        links: &dyn PeerLinkFactory,
        media: &dyn MediaSource,
        events: LinkEventSink,
    ) -> Result<Value, CallError> {
        if self.role != Role::Caller || self.state != NegotiationState::Idle {
            return Err(CallError::PeerLinkFailed(format!(
                "cannot offer from {:?}/{}",
                self.role, self.state
            )));
        }
        self.acquire_link(links, media, events).await?;
        let link = self.link()?;
        let offer = link.create_offer().await.map_err(CallError::peer_link)?;
        link.set_local_description(offer.clone())
            .await
            .map_err(CallError::peer_link)?;
        self.transition(NegotiationState::OfferSent);
        Ok(offer)
    }

    /// Callee side: Idle -> OfferReceived -> AnswerExchanged. Returns the
    /// answer blob to send.
    pub async fn accept_offer(
        &mut self,
        offer: Value,
        links: &dyn PeerLinkFactory,
        media: &dyn MediaSource,
        events: LinkEventSink,
    ) -> Result<Value, CallError> {
        if self.role != Role::Callee || self.state != NegotiationState::Idle {
            return Err(CallError::UnexpectedOffer(self.remote.clone()));
        }
        self.transition(NegotiationState::OfferReceived);
        self.acquire_link(links, media, events).await?;
        self.apply_remote_description(offer).await?;
        let link = self.link()?;
        let answer = link.create_answer().await.map_err(CallError::peer_link)?;
        link.set_local_description(answer.clone())
            .await
            .map_err(CallError::peer_link)?;
        self.transition(NegotiationState::AnswerExchanged);
        Ok(answer)
    }

    /// Caller side: OfferSent -> AnswerExchanged.
    pub async fn apply_answer(&mut self, answer: Value) -> Result<(), CallError> {
        if self.state != NegotiationState::OfferSent {
            return Err(CallError::PeerLinkFailed(format!(
                "answer in state {}",
                self.state
            )));
        }
        self.apply_remote_description(answer).await?;
        self.transition(NegotiationState::AnswerExchanged);
        Ok(())
    }

    /// The inbound buffer is flushed here and nowhere else.
    async fn apply_remote_description(&mut self, blob: Value) -> Result<(), CallError> {
        self.link()?
            .set_remote_description(blob)
            .await
            .map_err(CallError::peer_link)?;
        self.remote_description_set = true;
        let pending = self.inbound.drain();
        if !pending.is_empty() {
            logging::info_kv(
                "flushing buffered candidates",
                &[("remote", &self.remote), ("count", &pending.len().to_string())],
            );
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: Value) {
        if let Ok(link) = self.link() {
            // A single bad candidate does not sink the call.
            if let Err(err) = link.add_remote_candidate(candidate).await {
                logging::warn(format!(
                    "remote candidate rejected remote={} err={err:#}",
                    self.remote
                ));
            }
        }
    }

    pub async fn add_remote_candidate(&mut self, candidate: Value) {
        if self.state.is_terminal() {
            logging::debug(format!("candidate dropped after close remote={}", self.remote));
            return;
        }
        if self.remote_description_set {
            self.apply_candidate(candidate).await;
        } else {
            logging::debug(format!(
                "candidate buffered until remote description remote={}",
                self.remote
            ));
            self.inbound.push(candidate);
        }
    }

    /// Holds a local candidate while the relay is down. Returns false if the
    /// session is already finished and the candidate was dropped.
    pub fn queue_outbound(&mut self, candidate: Value) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.outbound.push(candidate);
        true
    }

    pub fn take_outbound(&mut self) -> Vec<Value> {
        if self.state.is_terminal() {
            self.outbound.clear();
            return Vec::new();
        }
        self.outbound.drain()
    }

    pub fn on_link_state(&mut self, state: PeerLinkState) -> LinkOutcome {
        if self.state.is_terminal() {
            return LinkOutcome::Unchanged;
        }
        match state {
            PeerLinkState::Connected => {
                if self.state == NegotiationState::AnswerExchanged {
                    self.transition(NegotiationState::Connected);
                    LinkOutcome::Connected
                } else {
                    logging::debug(format!(
                        "link connected in state {} remote={}",
                        self.state, self.remote
                    ));
                    LinkOutcome::Unchanged
                }
            }
            PeerLinkState::Failed => LinkOutcome::Failed,
            PeerLinkState::Closed => LinkOutcome::Closed,
            PeerLinkState::New | PeerLinkState::Connecting | PeerLinkState::Disconnected => {
                LinkOutcome::Unchanged
            }
        }
    }

    /// Stops the peer link and discards everything buffered. After this no
    /// method changes the state again.
    pub async fn release(&mut self, terminal: NegotiationState) {
        if self.state.is_terminal() {
            return;
        }
        self.inbound.clear();
        self.outbound.clear();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.transition(terminal);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}
