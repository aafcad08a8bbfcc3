use crate::core::connection::PeerLink;
use crate::utils::sos::SignalOfStop;
use serde_json::Value;
use std::sync::Arc;

/// Lifecycle phase of one remote device. A peer with no session is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Connecting,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// The lexicographically smaller device id opens the link.
///
/// Both sides evaluate this with swapped arguments and reach opposite
/// answers, so exactly one of them offers.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

pub(super) struct PeerSession {
    /// Distinguishes this session from earlier ones for the same peer.
    pub generation: u64,
    pub role: Role,
    pub phase: PeerPhase,
    /// `None` until the transport has created the link.
    pub link: Option<Arc<dyn PeerLink>>,
    /// Set once our offer or answer has gone out through signaling.
    pub described: bool,
    /// Local candidates gathered before `described`.
    pub held_candidates: Vec<Value>,
    /// Stops the link event pump.
    pub sos: SignalOfStop,
}

impl PeerSession {
    pub fn new(generation: u64, role: Role, sos: SignalOfStop) -> Self {
        Self {
            generation,
            role,
            phase: PeerPhase::Connecting,
            link: None,
            described: false,
            held_candidates: Vec::new(),
            sos,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, PeerPhase::Connecting | PeerPhase::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_choice_is_symmetric() {
        let ids = ["a", "b", "B", "device-10", "device-9", ""];
        for x in ids {
            for y in ids {
                if x == y {
                    assert!(!should_initiate(x, y));
                } else {
                    assert_ne!(should_initiate(x, y), should_initiate(y, x), "{x} vs {y}");
                }
            }
        }
        assert!(should_initiate("alice", "bob"));
        assert!(!should_initiate("bob", "alice"));
    }

    #[test]
    fn new_session_is_connecting_and_live() {
        let s = PeerSession::new(1, Role::Initiator, SignalOfStop::new());
        assert_eq!(s.phase, PeerPhase::Connecting);
        assert!(s.is_live());
        assert!(!s.described);
    }
}
