/// Failures surfaced by the call client.
///
/// `UnexpectedOffer` is only ever logged; every other variant can reach the
/// caller either as a command result or inside `CallEvent::CallFailed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("not registered with the relay")]
    NotRegistered,

    #[error("identity already taken: {0}")]
    IdentityTaken(String),

    #[error("registration for {0} is still pending")]
    RegistrationPending(String),

    #[error("a session with {0} is already live")]
    AlreadyInSession(String),

    #[error("unexpected offer from {0}")]
    UnexpectedOffer(String),

    #[error("relay channel is not open")]
    ChannelNotOpen,

    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("peer link failed: {0}")]
    PeerLinkFailed(String),

    #[error("relay connection lost before the call connected")]
    RelayLost,

    #[error("invalid call target: {0:?}")]
    InvalidTarget(String),

    #[error("no session with {0}")]
    NoSuchSession(String),

    #[error("call client stopped")]
    ClientStopped,
}

impl CallError {
    pub fn peer_link(err: anyhow::Error) -> Self {
        CallError::PeerLinkFailed(format!("{err:#}"))
    }
}
