pub mod candidates;
pub mod client;
pub mod config;
pub mod errors;
pub mod logging;
pub mod peerlink;
pub mod registry;
pub mod relay;
pub mod relayproto;
pub mod router;
pub mod session;
pub mod webrtc_link;

pub use client::{Client, ClientHandle};
pub use errors::CallError;
pub use router::CallEvent;
