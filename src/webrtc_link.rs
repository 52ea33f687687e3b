use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::{IceServerConfig, MediaConfig};
use crate::errors::CallError;
use crate::logging;
use crate::peerlink::{
    LinkEventSink, LocalMedia, MediaSource, PeerLink, PeerLinkEvent, PeerLinkFactory,
    PeerLinkState, RemoteTrack,
};

const STREAM_ID: &str = "peercall";

/// Builds `RTCPeerConnection`s for new sessions.
pub struct WebRtcLinkFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcLinkFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
            })
            .collect();
        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    async fn create_link(&self, events: LinkEventSink) -> Result<Box<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config())
                .await
                .context("new peer connection")?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            logging::debug(format!(
                                "local candidate remote={} candidate={}",
                                sink.remote(),
                                init.candidate
                            ));
                            match serde_json::to_value(&init) {
                                Ok(blob) => sink.emit(PeerLinkEvent::LocalCandidate(Some(blob))),
                                Err(err) => {
                                    logging::error(format!("encode local candidate: {err}"))
                                }
                            }
                        }
                        Err(err) => logging::error(format!("local candidate to_json: {err}")),
                    },
                    None => sink.emit(PeerLinkEvent::LocalCandidate(None)),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            logging::debug(format!(
                "peer connection state remote={} state={st:?}",
                sink.remote()
            ));
            if let Some(state) = map_state(st) {
                sink.emit(PeerLinkEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            sink.emit(PeerLinkEvent::RemoteTrack(RemoteTrack {
                kind: track.kind().to_string(),
                id: track.id(),
                stream_id: track.stream_id(),
            }));
            Box::pin(async {})
        }));

        Ok(Box::new(WebRtcPeerLink { pc }))
    }
}

fn map_state(st: RTCPeerConnectionState) -> Option<PeerLinkState> {
    match st {
        RTCPeerConnectionState::New => Some(PeerLinkState::New),
        RTCPeerConnectionState::Connecting => Some(PeerLinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerLinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerLinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerLinkState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerLinkState::Closed),
        _ => None,
    }
}

pub struct WebRtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        for track in &media.tracks {
            self.pc
                .add_track(track.clone())
                .await
                .context("add local track")?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<Value> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        Ok(serde_json::to_value(offer)?)
    }

    async fn create_answer(&self) -> Result<Value> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        Ok(serde_json::to_value(answer)?)
    }

    async fn set_local_description(&self, blob: Value) -> Result<()> {
        let desc: RTCSessionDescription =
            serde_json::from_value(blob).context("decode local description")?;
        self.pc
            .set_local_description(desc)
            .await
            .context("set local description")
    }

    async fn set_remote_description(&self, blob: Value) -> Result<()> {
        let desc: RTCSessionDescription =
            serde_json::from_value(blob).context("decode remote description")?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote description")
    }

    async fn add_remote_candidate(&self, blob: Value) -> Result<()> {
        let init: RTCIceCandidateInit =
            serde_json::from_value(blob).context("decode remote candidate")?;
        self.pc
            .add_ice_candidate(init)
            .await
            .context("add ice candidate")
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            logging::error(format!("peer connection close: {err}"));
        }
    }
}

/// Stand-in capture: one Opus and/or one VP8 sample track per call.
pub struct StaticMediaSource {
    media: MediaConfig,
}

impl StaticMediaSource {
    pub fn new(media: MediaConfig) -> Self {
        Self { media }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire_local_media(&self) -> Result<LocalMedia, CallError> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if self.media.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                STREAM_ID.to_owned(),
            )));
        }
        if self.media.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_owned(),
                STREAM_ID.to_owned(),
            )));
        }
        if tracks.is_empty() {
            return Err(CallError::MediaUnavailable(
                "audio and video capture are both disabled".into(),
            ));
        }
        Ok(LocalMedia { tracks })
    }
}
