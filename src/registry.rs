use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::candidates::CandidateBuffer;
use crate::errors::CallError;
use crate::session::{NegotiationState, Role, Session};

/// Early candidates kept per remote before its Offer shows up.
const EARLY_CANDIDATE_LIMIT: usize = 64;
/// Remotes with early candidates held at once; the oldest sender is evicted.
const EARLY_REMOTE_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    state: RegistrationState,
    identity: Option<String>,
}

impl Registration {
    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }
}

/// How an inbound Offer relates to what is already live for its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// No session yet: become Callee.
    Accept,
    /// Both sides offered and ours loses: drop ours, become Callee.
    YieldToRemote,
    /// Both sides offered and ours wins: the remote will answer us.
    KeepOwnOffer,
    /// Late or duplicate Offer.
    Unexpected,
}

/// Glare rule: the side with the lexicographically smaller identity yields.
pub fn local_yields(local: &str, remote: &str) -> bool {
    local < remote
}

/// Owns the local registration and at most one live session per remote.
///
/// The local identity is fixed per process, so keying sessions by remote
/// identity is keying them by the unordered (local, remote) pair.
pub struct SessionRegistry {
    registration: Registration,
    sessions: HashMap<String, Session>,
    early: HashMap<String, CandidateBuffer>,
    early_order: VecDeque<String>,
    released: HashSet<String>,
    next_generation: u64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            registration: Registration {
                state: RegistrationState::Unregistered,
                identity: None,
            },
            sessions: HashMap::new(),
            early: HashMap::new(),
            early_order: VecDeque::new(),
            released: HashSet::new(),
            next_generation: 1,
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Starts registering `identity`. Only possible from Unregistered; the
    /// identity stays fixed until registration fails or is aborted.
    pub fn begin_registration(&mut self, identity: &str) -> bool {
        if self.registration.state != RegistrationState::Unregistered {
            return false;
        }
        self.registration = Registration {
            state: RegistrationState::Registering,
            identity: Some(identity.to_string()),
        };
        true
    }

    /// Back to Registering for the current identity, e.g. after a relay
    /// reconnect. Returns the identity to re-register, if any.
    pub fn restart_registration(&mut self) -> Option<String> {
        match self.registration.state {
            RegistrationState::Unregistered => None,
            RegistrationState::Registering | RegistrationState::Registered => {
                self.registration.state = RegistrationState::Registering;
                self.registration.identity.clone()
            }
        }
    }

    pub fn abort_registration(&mut self) {
        self.registration = Registration {
            state: RegistrationState::Unregistered,
            identity: None,
        };
    }

    /// Applies a `RegisterAck`. Acks with nothing outstanding are ignored
    /// and yield `Ok(None)`.
    pub fn complete_registration(&mut self, success: bool) -> Result<Option<String>, CallError> {
        if self.registration.state != RegistrationState::Registering {
            return Ok(None);
        }
        let identity = self.registration.identity.clone().unwrap_or_default();
        if success {
            self.registration.state = RegistrationState::Registered;
            Ok(Some(identity))
        } else {
            self.abort_registration();
            Err(CallError::IdentityTaken(identity))
        }
    }

    pub fn require_registered(&self) -> Result<&str, CallError> {
        match (&self.registration.state, &self.registration.identity) {
            (RegistrationState::Registered, Some(identity)) => Ok(identity),
            _ => Err(CallError::NotRegistered),
        }
    }

    fn allocate_generation(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation += 1;
        g
    }

    /// Creates an Idle Caller session for `remote`.
    pub fn open_caller(&mut self, remote: &str) -> Result<&mut Session, CallError> {
        let local = self.require_registered()?.to_string();
        if remote.is_empty() || remote == local {
            return Err(CallError::InvalidTarget(remote.to_string()));
        }
        if self.sessions.contains_key(remote) {
            return Err(CallError::AlreadyInSession(remote.to_string()));
        }
        self.released.remove(remote);
        self.drop_early(remote);
        let generation = self.allocate_generation();
        let session = Session::new(&local, remote, Role::Caller, generation);
        Ok(self.sessions.entry(remote.to_string()).or_insert(session))
    }

    /// Creates an Idle Callee session for `remote`, adopting any early
    /// candidates plus `carried` (from a session discarded by glare).
    pub fn open_callee(
        &mut self,
        remote: &str,
        carried: CandidateBuffer,
    ) -> Result<&mut Session, CallError> {
        let local = self.require_registered()?.to_string();
        if self.sessions.contains_key(remote) {
            return Err(CallError::AlreadyInSession(remote.to_string()));
        }
        self.released.remove(remote);
        let generation = self.allocate_generation();
        let mut session = Session::new(&local, remote, Role::Callee, generation);
        session.adopt_inbound(carried);
        if let Some(early) = self.drop_early(remote) {
            session.adopt_inbound(early);
        }
        Ok(self.sessions.entry(remote.to_string()).or_insert(session))
    }

    pub fn classify_offer(&self, from: &str) -> OfferDisposition {
        let Some(session) = self.sessions.get(from) else {
            return OfferDisposition::Accept;
        };
        let mutual = session.role() == Role::Caller
            && matches!(
                session.state(),
                NegotiationState::Idle | NegotiationState::OfferSent
            );
        if !mutual {
            return OfferDisposition::Unexpected;
        }
        if local_yields(session.local(), from) {
            OfferDisposition::YieldToRemote
        } else {
            OfferDisposition::KeepOwnOffer
        }
    }

    pub fn get(&self, remote: &str) -> Option<&Session> {
        self.sessions.get(remote)
    }

    pub fn get_mut(&mut self, remote: &str) -> Option<&mut Session> {
        self.sessions.get_mut(remote)
    }

    /// The live session for `remote`, only if it is the same incarnation.
    pub fn get_current(&mut self, remote: &str, generation: u64) -> Option<&mut Session> {
        self.sessions
            .get_mut(remote)
            .filter(|s| s.generation() == generation)
    }

    /// Removes the session; the caller must release it. Later Answers and
    /// Candidates from `remote` are dropped until a new session starts.
    pub fn evict(&mut self, remote: &str) -> Option<Session> {
        let session = self.sessions.remove(remote)?;
        self.released.insert(remote.to_string());
        self.drop_early(remote);
        Some(session)
    }

    pub fn was_released(&self, remote: &str) -> bool {
        self.released.contains(remote)
    }

    /// Holds a candidate from a remote that has no session yet. Returns
    /// false when it was dropped instead.
    pub fn hold_early_candidate(&mut self, from: &str, candidate: Value) -> bool {
        if self.released.contains(from) {
            return false;
        }
        if !self.early.contains_key(from) {
            while self.early.len() >= EARLY_REMOTE_LIMIT {
                let Some(oldest) = self.early_order.pop_front() else {
                    break;
                };
                self.early.remove(&oldest);
            }
            self.early_order.push_back(from.to_string());
        }
        self.early
            .entry(from.to_string())
            .or_insert_with(|| CandidateBuffer::bounded(EARLY_CANDIDATE_LIMIT))
            .push(candidate);
        true
    }

    fn drop_early(&mut self, remote: &str) -> Option<CandidateBuffer> {
        let held = self.early.remove(remote)?;
        self.early_order.retain(|r| r != remote);
        Some(held)
    }

    /// Number of remotes that currently have early candidates held.
    pub fn early_remotes(&self) -> usize {
        self.early.len()
    }

    pub fn early_candidates(&self, from: &str) -> usize {
        self.early.get(from).map(CandidateBuffer::len).unwrap_or(0)
    }

    pub fn remotes(&self) -> Vec<String> {
        let mut out: Vec<String> = self.sessions.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registered(identity: &str) -> SessionRegistry {
        let mut reg = SessionRegistry::new();
        assert!(reg.begin_registration(identity));
        assert_eq!(
            reg.complete_registration(true).unwrap().as_deref(),
            Some(identity)
        );
        reg
    }

    #[test]
    fn registration_lifecycle() {
        let mut reg = SessionRegistry::new();
        assert_eq!(reg.registration().state(), RegistrationState::Unregistered);
        assert_eq!(reg.require_registered(), Err(CallError::NotRegistered));

        assert!(reg.begin_registration("alice"));
        assert_eq!(reg.registration().state(), RegistrationState::Registering);
        assert!(!reg.begin_registration("alice"));

        assert!(!reg.begin_registration("mallory"));
        assert_eq!(reg.registration().identity(), Some("alice"));

        reg.complete_registration(true).unwrap();
        assert_eq!(reg.require_registered(), Ok("alice"));
        // Already registered: no-op, whatever the name.
        assert!(!reg.begin_registration("alice"));
        assert!(!reg.begin_registration("mallory"));
        assert_eq!(reg.require_registered(), Ok("alice"));
        // Stray ack.
        assert_eq!(reg.complete_registration(false), Ok(None));
        assert_eq!(reg.registration().state(), RegistrationState::Registered);
    }

    #[test]
    fn duplicate_identity_returns_to_unregistered() {
        let mut reg = SessionRegistry::new();
        reg.begin_registration("alice");
        assert_eq!(
            reg.complete_registration(false),
            Err(CallError::IdentityTaken("alice".into()))
        );
        assert_eq!(reg.registration().state(), RegistrationState::Unregistered);
        assert_eq!(reg.registration().identity(), None);
    }

    #[test]
    fn restart_keeps_identity() {
        let mut reg = registered("alice");
        assert_eq!(reg.restart_registration().as_deref(), Some("alice"));
        assert_eq!(reg.registration().state(), RegistrationState::Registering);
        assert_eq!(SessionRegistry::new().restart_registration(), None);
    }

    #[test]
    fn one_session_per_remote() {
        let mut reg = registered("alice");
        assert_eq!(
            SessionRegistry::new().open_caller("bob").unwrap_err(),
            CallError::NotRegistered
        );
        reg.open_caller("bob").unwrap();
        assert_eq!(
            reg.open_caller("bob").unwrap_err(),
            CallError::AlreadyInSession("bob".into())
        );
        assert_eq!(
            reg.open_callee("bob", CandidateBuffer::new()).unwrap_err(),
            CallError::AlreadyInSession("bob".into())
        );
        assert_eq!(
            reg.open_caller("alice").unwrap_err(),
            CallError::InvalidTarget("alice".into())
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn glare_is_decided_by_identity_order() {
        assert!(local_yields("alice", "bob"));
        assert!(!local_yields("bob", "alice"));

        let mut alice = registered("alice");
        alice.open_caller("bob").unwrap();
        assert_eq!(alice.classify_offer("bob"), OfferDisposition::YieldToRemote);

        let mut bob = registered("bob");
        bob.open_caller("alice").unwrap();
        assert_eq!(bob.classify_offer("alice"), OfferDisposition::KeepOwnOffer);

        assert_eq!(bob.classify_offer("carol"), OfferDisposition::Accept);
    }

    #[test]
    fn offers_for_callee_sessions_are_unexpected() {
        let mut reg = registered("alice");
        reg.open_callee("bob", CandidateBuffer::new()).unwrap();
        assert_eq!(reg.classify_offer("bob"), OfferDisposition::Unexpected);
    }

    #[test]
    fn early_candidates_are_adopted_in_order() {
        let mut reg = registered("alice");
        assert!(reg.hold_early_candidate("bob", json!("c1")));
        assert!(reg.hold_early_candidate("bob", json!("c2")));
        let mut carried = CandidateBuffer::new();
        carried.push(json!("c0"));
        let session = reg.open_callee("bob", carried).unwrap();
        assert_eq!(session.pending_inbound(), 3);
        assert_eq!(reg.early_candidates("bob"), 0);
    }

    #[test]
    fn evicted_remotes_drop_candidates_until_next_session() {
        let mut reg = registered("alice");
        let generation = reg.open_caller("bob").unwrap().generation();
        assert!(reg.get_current("bob", generation).is_some());
        assert!(reg.get_current("bob", generation + 1).is_none());

        assert!(reg.evict("bob").is_some());
        assert!(reg.was_released("bob"));
        assert!(!reg.hold_early_candidate("bob", json!("late")));
        assert!(reg.is_empty());

        let next = reg.open_caller("bob").unwrap().generation();
        assert!(next > generation);
        assert!(!reg.was_released("bob"));
    }

    #[test]
    fn early_senders_are_bounded_oldest_first() {
        let mut reg = registered("alice");
        for i in 0..20_000 {
            assert!(reg.hold_early_candidate(&format!("sender-{i}"), json!("c")));
        }
        assert_eq!(reg.early_remotes(), EARLY_REMOTE_LIMIT);
        assert_eq!(reg.early_candidates("sender-0"), 0);
        assert_eq!(reg.early_candidates("sender-19999"), 1);

        // A sender that shows up again keeps its slot and its order.
        let kept = format!("sender-{}", 20_000 - EARLY_REMOTE_LIMIT);
        reg.hold_early_candidate(&kept, json!("c2"));
        assert_eq!(reg.early_candidates(&kept), 2);
        assert_eq!(reg.early_remotes(), EARLY_REMOTE_LIMIT);

        let session = reg.open_callee(&kept, CandidateBuffer::new()).unwrap();
        assert_eq!(session.pending_inbound(), 2);
        assert_eq!(reg.early_remotes(), EARLY_REMOTE_LIMIT - 1);
        reg.hold_early_candidate("newcomer", json!("c"));
        assert_eq!(reg.early_remotes(), EARLY_REMOTE_LIMIT);
        assert_eq!(reg.early_candidates("sender-19999"), 1);
    }
}
