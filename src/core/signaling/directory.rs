//! Client-side view of the room directory.

use crate::core::protocol::{Device, ServerFrame, SignalFrame, SignalType};

/// What an inbound server frame means for the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Presence changed; carries the full peer list.
    Peers(Vec<Device>),
    Signal(SignalFrame),
    SignalError { to: String, signal_type: SignalType },
}

/// Peer list of one room, self excluded, in arrival order.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    self_id: String,
    peers: Vec<Device>,
}

impl PeerDirectory {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            peers: Vec::new(),
        }
    }

    pub fn peers(&self) -> &[Device] {
        &self.peers
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Apply `frame` and report what to dispatch.
    pub fn apply(&mut self, frame: ServerFrame) -> Dispatch {
        match frame {
            ServerFrame::PeersSync { peers, .. } => {
                self.peers = peers
                    .into_iter()
                    .filter(|p| p.device_id != self.self_id)
                    .collect();
                Dispatch::Peers(self.peers.clone())
            }
            ServerFrame::PeerJoined { peer, .. } => {
                if peer.device_id != self.self_id {
                    match self.peers.iter_mut().find(|p| p.device_id == peer.device_id) {
                        Some(existing) => *existing = peer,
                        None => self.peers.push(peer),
                    }
                }
                Dispatch::Peers(self.peers.clone())
            }
            ServerFrame::PeerLeft { device_id, .. } => {
                self.peers.retain(|p| p.device_id != device_id);
                Dispatch::Peers(self.peers.clone())
            }
            ServerFrame::Signal(signal) => Dispatch::Signal(signal),
            ServerFrame::SignalError { to, signal_type, .. } => {
                Dispatch::SignalError { to, signal_type }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str, name: &str) -> Device {
        Device {
            device_id: id.into(),
            device_name: name.into(),
            color: String::new(),
        }
    }

    #[test]
    fn sync_excludes_self() {
        let mut dir = PeerDirectory::new("me");
        let out = dir.apply(ServerFrame::PeersSync {
            room_id: "r".into(),
            peers: vec![dev("me", "Me"), dev("a", "A")],
        });
        assert_eq!(out, Dispatch::Peers(vec![dev("a", "A")]));
    }

    #[test]
    fn joined_upserts_and_left_removes() {
        let mut dir = PeerDirectory::new("me");
        dir.apply(ServerFrame::PeerJoined {
            room_id: "r".into(),
            peer: dev("a", "A"),
        });
        dir.apply(ServerFrame::PeerJoined {
            room_id: "r".into(),
            peer: dev("a", "Renamed"),
        });
        dir.apply(ServerFrame::PeerJoined {
            room_id: "r".into(),
            peer: dev("me", "Me"),
        });
        assert_eq!(dir.peers(), &[dev("a", "Renamed")]);

        let out = dir.apply(ServerFrame::PeerLeft {
            room_id: "r".into(),
            device_id: "a".into(),
        });
        assert_eq!(out, Dispatch::Peers(vec![]));
    }
}
