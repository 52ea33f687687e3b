//! Narrow interface over the point-to-point negotiation capability.
//!
//! The core only moves opaque description and candidate blobs through these
//! traits; `webrtc_link` provides the concrete adapter.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

use crate::errors::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: String,
    pub id: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerLinkEvent {
    /// `None` marks the end of local candidate gathering.
    LocalCandidate(Option<Value>),
    ConnectionState(PeerLinkState),
    RemoteTrack(RemoteTrack),
}

/// A peer-link event tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub remote: String,
    pub generation: u64,
    pub event: PeerLinkEvent,
}

/// Handed to a peer link at creation; its callbacks report through here.
#[derive(Clone)]
pub struct LinkEventSink {
    remote: String,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    pub fn new(remote: &str, generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            remote: remote.to_string(),
            generation,
            tx,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerLinkEvent) {
        // The loop may already be gone during shutdown.
        let _ = self.tx.send(LinkEvent {
            remote: self.remote.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// Locally captured tracks, produced by a `MediaSource`.
#[derive(Clone, Default)]
pub struct LocalMedia {
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()>;
    async fn create_offer(&self) -> Result<Value>;
    async fn create_answer(&self) -> Result<Value>;
    async fn set_local_description(&self, blob: Value) -> Result<()>;
    async fn set_remote_description(&self, blob: Value) -> Result<()>;
    async fn add_remote_candidate(&self, blob: Value) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create_link(&self, events: LinkEventSink) -> Result<Box<dyn PeerLink>>;
}

/// Camera/microphone acquisition lives outside the core.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_local_media(&self) -> Result<LocalMedia, CallError>;
}
