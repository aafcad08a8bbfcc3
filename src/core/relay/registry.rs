//! In-memory room registry.
//!
//! Maps rooms to their device directory and live sockets. Only the relay
//! actor touches it, so it carries no locks.

use crate::core::protocol::Device;
use std::collections::{HashMap, HashSet};

/// Relay-local identifier of one WebSocket connection.
pub type ConnId = u64;

#[derive(Debug, Default)]
pub struct RoomState {
    pub devices: HashMap<String, Device>,
    pub sockets: HashSet<ConnId>,
    pub socket_to_device: HashMap<ConnId, String>,
}

impl RoomState {
    fn is_device_mapped(&self, device_id: &str) -> bool {
        self.socket_to_device.values().any(|d| d == device_id)
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, RoomState>,
    conn_rooms: HashMap<ConnId, String>,
}

impl RoomRegistry {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` as `device` in `room_id` and return the directory
    /// without the joining device.
    ///
    /// A second join on the same connection first leaves the previous
    /// binding; the returned departure (if any) must be broadcast by the
    /// caller.
    pub fn join(
        &mut self,
        room_id: &str,
        conn: ConnId,
        device: Device,
    ) -> (Vec<Device>, Option<(String, String)>) {
        let departed = if self.conn_rooms.contains_key(&conn) {
            self.leave(conn)
        } else {
            None
        };

        let room = self.rooms.entry(room_id.to_string()).or_default();
        room.sockets.insert(conn);
        room.socket_to_device.insert(conn, device.device_id.clone());
        let joining_id = device.device_id.clone();
        room.devices.insert(joining_id.clone(), device);
        self.conn_rooms.insert(conn, room_id.to_string());

        let peers = room
            .devices
            .values()
            .filter(|d| d.device_id != joining_id)
            .cloned()
            .collect();
        (peers, departed)
    }

    /// Drop `conn` from its room.
    ///
    /// Returns `(room_id, device_id)` when a departure must be announced,
    /// i.e. the device no longer has any socket in that room. The room is
    /// pruned as soon as its last socket leaves.
    pub fn leave(&mut self, conn: ConnId) -> Option<(String, String)> {
        let room_id = self.conn_rooms.remove(&conn)?;
        let room = self.rooms.get_mut(&room_id)?;

        room.sockets.remove(&conn);
        let device_id = room.socket_to_device.remove(&conn);

        let departed = match device_id {
            Some(id) if !room.is_device_mapped(&id) => {
                room.devices.remove(&id);
                Some((room_id.clone(), id))
            }
            _ => None,
        };

        if room.sockets.is_empty() {
            self.rooms.remove(&room_id);
        }
        departed
    }

    /// Sockets currently mapped to `device_id` in `room_id`.
    pub fn lookup(&self, room_id: &str, device_id: &str) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.socket_to_device
                    .iter()
                    .filter(|(_, d)| d.as_str() == device_id)
                    .map(|(c, _)| *c)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every socket in `room_id`.
    pub fn members(&self, room_id: &str) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|room| room.sockets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The `(room_id, device_id)` that `conn` joined as.
    pub fn binding(&self, conn: ConnId) -> Option<(&str, &str)> {
        let room_id = self.conn_rooms.get(&conn)?;
        let device_id = self.rooms.get(room_id)?.socket_to_device.get(&conn)?;
        Some((room_id.as_str(), device_id.as_str()))
    }

    #[cfg(test)]
    pub fn has_device(&self, room_id: &str, device_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.devices.contains_key(device_id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for (room_id, room) in &self.rooms {
            assert!(!room.sockets.is_empty(), "room {room_id} kept with no sockets");
            for conn in room.socket_to_device.keys() {
                assert!(room.sockets.contains(conn), "mapping for unknown socket {conn}");
            }
            for id in room.devices.keys() {
                assert!(room.is_device_mapped(id), "device {id} without socket");
            }
            for id in room.socket_to_device.values() {
                assert!(room.devices.contains_key(id), "socket maps to missing device {id}");
            }
        }
        for (conn, room_id) in &self.conn_rooms {
            let room = self.rooms.get(room_id).expect("conn points to a live room");
            assert!(room.sockets.contains(conn));
        }
    }
}
