#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use peercall_rs::errors::CallError;
use peercall_rs::peerlink::{
    LinkEvent, LinkEventSink, LocalMedia, MediaSource, PeerLink, PeerLinkEvent, PeerLinkFactory,
    PeerLinkState,
};
use peercall_rs::relay::{ChannelStatus, RelayEvent, RelaySink};
use peercall_rs::relayproto::RelayMessage;
use peercall_rs::router::{CallEvent, SignalingRouter};

/// Everything a fake peer link was asked to do.
#[derive(Debug, Default)]
pub struct LinkLog {
    pub media_added: bool,
    pub local_descriptions: Vec<Value>,
    pub remote_descriptions: Vec<Value>,
    pub candidates: Vec<Value>,
    pub closed: bool,
}

pub struct FakeLink {
    remote: String,
    generation: u64,
    log: Arc<Mutex<LinkLog>>,
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_local_media(&self, _media: &LocalMedia) -> Result<()> {
        self.log.lock().unwrap().media_added = true;
        Ok(())
    }

    async fn create_offer(&self) -> Result<Value> {
        Ok(json!({"type": "offer", "sdp": format!("offer-{}-{}", self.remote, self.generation)}))
    }

    async fn create_answer(&self) -> Result<Value> {
        Ok(json!({"type": "answer", "sdp": format!("answer-{}-{}", self.remote, self.generation)}))
    }

    async fn set_local_description(&self, blob: Value) -> Result<()> {
        self.log.lock().unwrap().local_descriptions.push(blob);
        Ok(())
    }

    async fn set_remote_description(&self, blob: Value) -> Result<()> {
        self.log.lock().unwrap().remote_descriptions.push(blob);
        Ok(())
    }

    async fn add_remote_candidate(&self, blob: Value) -> Result<()> {
        if blob == json!("bad") {
            bail!("malformed candidate");
        }
        self.log.lock().unwrap().candidates.push(blob);
        Ok(())
    }

    async fn close(&self) {
        self.log.lock().unwrap().closed = true;
    }
}

/// Hands out `FakeLink`s and keeps their event sinks so tests can play the
/// part of the network.
#[derive(Default)]
pub struct FakeLinkFactory {
    links: Mutex<Vec<(LinkEventSink, Arc<Mutex<LinkLog>>)>>,
}

impl FakeLinkFactory {
    pub fn count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn sink(&self, idx: usize) -> LinkEventSink {
        self.links.lock().unwrap()[idx].0.clone()
    }

    pub fn log(&self, idx: usize) -> Arc<Mutex<LinkLog>> {
        self.links.lock().unwrap()[idx].1.clone()
    }

    pub fn candidates(&self, idx: usize) -> Vec<Value> {
        self.log(idx).lock().unwrap().candidates.clone()
    }

    pub fn closed(&self, idx: usize) -> bool {
        self.log(idx).lock().unwrap().closed
    }

    pub fn emit(&self, idx: usize, event: PeerLinkEvent) {
        self.sink(idx).emit(event);
    }

    pub fn emit_state(&self, idx: usize, state: PeerLinkState) {
        self.emit(idx, PeerLinkEvent::ConnectionState(state));
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn create_link(&self, events: LinkEventSink) -> Result<Box<dyn PeerLink>> {
        let log = Arc::new(Mutex::new(LinkLog::default()));
        let link = FakeLink {
            remote: events.remote().to_string(),
            generation: events.generation(),
            log: log.clone(),
        };
        self.links.lock().unwrap().push((events, log));
        Ok(Box::new(link))
    }
}

pub struct FakeMedia {
    available: bool,
}

impl FakeMedia {
    pub fn available() -> Self {
        Self { available: true }
    }

    pub fn unavailable() -> Self {
        Self { available: false }
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire_local_media(&self) -> Result<LocalMedia, CallError> {
        if self.available {
            Ok(LocalMedia::default())
        } else {
            Err(CallError::MediaUnavailable("no camera".into()))
        }
    }
}

/// Relay sink that records every frame instead of writing to a socket.
#[derive(Default)]
pub struct RecordingRelay {
    open: AtomicBool,
    sent: Mutex<Vec<RelayMessage>>,
}

impl RecordingRelay {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn take_sent(&self) -> Vec<RelayMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|m| m.kind()).collect()
    }
}

impl RelaySink for RecordingRelay {
    fn send(&self, msg: &RelayMessage) -> Result<(), CallError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CallError::ChannelNotOpen);
        }
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// One side of a call: a router wired to fakes.
pub struct Peer {
    pub router: SignalingRouter,
    pub relay: Arc<RecordingRelay>,
    pub links: Arc<FakeLinkFactory>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<CallEvent>,
}

impl Peer {
    pub fn new() -> Self {
        Self::with_media(FakeMedia::available())
    }

    pub fn with_media(media: FakeMedia) -> Self {
        let relay = Arc::new(RecordingRelay::default());
        let links = Arc::new(FakeLinkFactory::default());
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(
            relay.clone(),
            links.clone(),
            Arc::new(media),
            link_tx,
            events_tx,
        );
        Self {
            router,
            relay,
            links,
            link_rx,
            events_rx,
        }
    }

    pub async fn registered(identity: &str) -> Self {
        let mut peer = Self::new();
        peer.register(identity).await;
        peer
    }

    pub async fn register(&mut self, identity: &str) {
        self.set_channel(ChannelStatus::Open).await;
        self.router.register(identity).unwrap();
        self.router
            .handle_relay_message(RelayMessage::RegisterAck { success: true })
            .await;
        self.relay.take_sent();
        self.events();
    }

    pub async fn set_channel(&mut self, status: ChannelStatus) {
        self.relay.set_open(status == ChannelStatus::Open);
        self.router
            .handle_relay_event(RelayEvent::StatusChanged(status))
            .await;
    }

    /// Feeds every pending peer-link callback through the router.
    pub async fn pump_links(&mut self) {
        while let Ok(event) = self.link_rx.try_recv() {
            self.router.handle_link_event(event).await;
        }
    }

    pub fn events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn receive(&mut self, msg: RelayMessage) {
        self.router.handle_relay_message(msg).await;
    }
}

/// Moves everything `from` has sent so far into `to`'s router, in order.
pub async fn relay_between(from: &mut Peer, to: &mut Peer) -> Vec<RelayMessage> {
    let sent = from.relay.take_sent();
    for msg in sent.clone() {
        to.receive(msg).await;
    }
    sent
}

pub fn candidate(from: &str, to: &str, blob: Value) -> RelayMessage {
    RelayMessage::Candidate {
        from: from.into(),
        to: to.into(),
        candidate: blob,
    }
}

pub fn answer(from: &str, to: &str) -> RelayMessage {
    RelayMessage::Answer {
        from: from.into(),
        to: to.into(),
        answer: json!({"type": "answer", "sdp": format!("answer-from-{from}")}),
    }
}

pub fn offer(from: &str, to: &str) -> RelayMessage {
    RelayMessage::Offer {
        from: from.into(),
        to: to.into(),
        offer: json!({"type": "offer", "sdp": format!("offer-from-{from}")}),
    }
}
