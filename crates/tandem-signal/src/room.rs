//! Room registry and lifecycle for the signaling endpoint
//!
//! A room holds at most two peers in slots A and B. Rooms are created by the
//! first `register` for an id and deleted when the last occupant leaves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info};

use tandem_core::{SignalError, MAX_ROOM_OCCUPANTS};

use crate::transport::SharedSink;

/// Server-assigned identity of one signaling connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Peer slot within a room
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

/// Occupancy state of a room
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomState {
    Empty,
    HalfOpen,
    Full,
}

/// A peer in a room
pub struct Peer {
    pub id: PeerId,
    pub sink: SharedSink,
    pub joined_at: Instant,
}

/// Result of a successful join
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoinTicket {
    pub slot: Slot,
    /// Another peer was already in the room
    pub is_existing_peer: bool,
}

/// Room errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    RoomFull,
    AlreadyJoined,
}

/// A two-party relay session
pub struct Room {
    pub room_id: String,
    a: Option<Peer>,
    b: Option<Peer>,
}

impl Room {
    pub fn new(room_id: String) -> Self {
        Self {
            room_id,
            a: None,
            b: None,
        }
    }

    /// Put a peer in the first free slot
    pub fn add_peer(&mut self, peer: Peer) -> Result<JoinTicket, RoomError> {
        if self.slot_of(peer.id).is_some() {
            return Err(RoomError::AlreadyJoined);
        }

        let is_existing_peer = !self.is_empty();
        let slot = match (&self.a, &self.b) {
            (None, _) => {
                self.a = Some(peer);
                Slot::A
            }
            (Some(_), None) => {
                self.b = Some(peer);
                Slot::B
            }
            (Some(_), Some(_)) => return Err(RoomError::RoomFull),
        };

        Ok(JoinTicket {
            slot,
            is_existing_peer,
        })
    }

    /// Clear the slot held by `peer_id`
    pub fn remove_peer(&mut self, peer_id: PeerId) -> Option<Peer> {
        match self.slot_of(peer_id)? {
            Slot::A => self.a.take(),
            Slot::B => self.b.take(),
        }
    }

    pub fn slot_of(&self, peer_id: PeerId) -> Option<Slot> {
        if self.a.as_ref().is_some_and(|p| p.id == peer_id) {
            Some(Slot::A)
        } else if self.b.as_ref().is_some_and(|p| p.id == peer_id) {
            Some(Slot::B)
        } else {
            None
        }
    }

    pub fn peer(&self, slot: Slot) -> Option<&Peer> {
        match slot {
            Slot::A => self.a.as_ref(),
            Slot::B => self.b.as_ref(),
        }
    }

    /// The occupant of the other slot, if `peer_id` is in this room
    pub fn partner_of(&self, peer_id: PeerId) -> Option<&Peer> {
        match self.slot_of(peer_id)? {
            Slot::A => self.b.as_ref(),
            Slot::B => self.a.as_ref(),
        }
    }

    pub fn occupancy(&self) -> usize {
        usize::from(self.a.is_some()) + usize::from(self.b.is_some())
    }

    pub fn state(&self) -> RoomState {
        match self.occupancy() {
            0 => RoomState::Empty,
            n if n < MAX_ROOM_OCCUPANTS => RoomState::HalfOpen,
            _ => RoomState::Full,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }
}

/// Outcome of a leave
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The peer held a slot and it was cleared
    pub removed: bool,
    /// The room became empty and was deleted
    pub room_deleted: bool,
}

/// All live rooms, keyed by room id
///
/// Every mutation happens under the map's per-key lock and no lock is held
/// across an await.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room_id`, creating it if needed
    ///
    /// The returned membership leaves the room when dropped.
    pub fn join(
        self: &Arc<Self>,
        room_id: &str,
        sink: SharedSink,
    ) -> Result<RoomMembership, SignalError> {
        let peer_id = PeerId::next();
        let ticket = {
            let mut room = self
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Room::new(room_id.to_string()));

            let peer = Peer {
                id: peer_id,
                sink: sink.clone(),
                joined_at: Instant::now(),
            };
            match room.add_peer(peer) {
                Ok(ticket) => ticket,
                Err(RoomError::RoomFull) => {
                    return Err(SignalError::RoomFull(room_id.to_string()));
                }
                Err(RoomError::AlreadyJoined) => {
                    return Err(SignalError::Internal(format!(
                        "{} already joined room {}",
                        peer_id, room_id
                    )));
                }
            }
        };

        info!(
            "Peer {} joined room {} in slot {:?} (existing peer: {})",
            peer_id, room_id, ticket.slot, ticket.is_existing_peer
        );

        Ok(RoomMembership {
            registry: Arc::clone(self),
            room_id: room_id.to_string(),
            peer_id,
            ticket,
            sink,
        })
    }

    /// Remove a peer; deletes the room once both slots are empty
    pub fn leave(&self, room_id: &str, peer_id: PeerId) -> LeaveOutcome {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut room) => room.remove_peer(peer_id),
            None => None,
        };

        // A concurrent join may refill the room between the two steps; remove_if
        // re-checks emptiness under the lock.
        let room_deleted =
            removed.is_some() && self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some();

        if let Some(peer) = &removed {
            info!(
                "Peer {} left room {} after {:?}",
                peer_id,
                room_id,
                peer.joined_at.elapsed()
            );
        }
        if room_deleted {
            debug!("Room {} removed (empty)", room_id);
        }

        LeaveOutcome {
            removed: removed.is_some(),
            room_deleted,
        }
    }

    /// Sink of the other occupant, cloned out so the lock is released before I/O
    pub fn partner(&self, room_id: &str, peer_id: PeerId) -> Option<SharedSink> {
        let room = self.rooms.get(room_id)?;
        room.partner_of(peer_id).map(|p| p.sink.clone())
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn occupancy(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|r| r.occupancy()).unwrap_or(0)
    }

    pub fn state(&self, room_id: &str) -> RoomState {
        self.rooms.get(room_id).map(|r| r.state()).unwrap_or(RoomState::Empty)
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get peer count across all rooms (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.rooms.iter().map(|r| r.occupancy()).sum()
    }
}

/// A connection's seat in a room
///
/// Dropping the membership performs the leave, so cleanup runs exactly once
/// however the connection ends.
pub struct RoomMembership {
    registry: Arc<RoomRegistry>,
    room_id: String,
    peer_id: PeerId,
    ticket: JoinTicket,
    sink: SharedSink,
}

impl RoomMembership {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn slot(&self) -> Slot {
        self.ticket.slot
    }

    pub fn is_existing_peer(&self) -> bool {
        self.ticket.is_existing_peer
    }

    /// This connection's own sink
    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub fn partner(&self) -> Option<SharedSink> {
        self.registry.partner(&self.room_id, self.peer_id)
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        self.registry.leave(&self.room_id, self.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingSink;

    fn make_peer() -> Peer {
        Peer {
            id: PeerId::next(),
            sink: RecordingSink::shared(),
            joined_at: Instant::now(),
        }
    }

    #[test]
    fn test_room_creation() {
        let room = Room::new("room1".into());
        assert_eq!(room.room_id, "room1");
        assert!(room.is_empty());
        assert_eq!(room.state(), RoomState::Empty);
    }

    #[test]
    fn test_slot_assignment() {
        let mut room = Room::new("room1".into());

        let first = make_peer();
        let first_id = first.id;
        let ticket = room.add_peer(first).unwrap();
        assert_eq!(ticket.slot, Slot::A);
        assert!(!ticket.is_existing_peer);
        assert_eq!(room.state(), RoomState::HalfOpen);

        let second = make_peer();
        let second_id = second.id;
        let ticket = room.add_peer(second).unwrap();
        assert_eq!(ticket.slot, Slot::B);
        assert!(ticket.is_existing_peer);
        assert_eq!(room.state(), RoomState::Full);

        assert_eq!(room.partner_of(first_id).map(|p| p.id), Some(second_id));
        assert_eq!(room.partner_of(second_id).map(|p| p.id), Some(first_id));
    }

    #[test]
    fn test_room_full() {
        let mut room = Room::new("room1".into());
        room.add_peer(make_peer()).unwrap();
        room.add_peer(make_peer()).unwrap();

        assert!(matches!(room.add_peer(make_peer()), Err(RoomError::RoomFull)));
        assert_eq!(room.occupancy(), 2);
    }

    #[test]
    fn test_vacated_slot_is_reused() {
        let mut room = Room::new("room1".into());
        let first = make_peer();
        let first_id = first.id;
        room.add_peer(first).unwrap();
        room.add_peer(make_peer()).unwrap();

        assert!(room.remove_peer(first_id).is_some());
        assert!(room.remove_peer(first_id).is_none());
        assert_eq!(room.state(), RoomState::HalfOpen);

        // The remaining occupant makes the newcomer a joiner, not a creator
        let ticket = room.add_peer(make_peer()).unwrap();
        assert_eq!(ticket.slot, Slot::A);
        assert!(ticket.is_existing_peer);
    }

    #[test]
    fn test_registry_join_and_leave() {
        let registry = Arc::new(RoomRegistry::new());

        let a = registry.join("room1", RecordingSink::shared()).unwrap();
        assert!(!a.is_existing_peer());
        assert_eq!(a.slot(), Slot::A);
        assert!(a.partner().is_none());

        let b = registry.join("room1", RecordingSink::shared()).unwrap();
        assert!(b.is_existing_peer());
        assert!(a.partner().is_some());
        assert_eq!(registry.state("room1"), RoomState::Full);

        let third = registry.join("room1", RecordingSink::shared());
        assert!(matches!(third, Err(SignalError::RoomFull(ref id)) if id == "room1"));
        assert_eq!(registry.occupancy("room1"), 2);

        drop(a);
        assert_eq!(registry.occupancy("room1"), 1);
        assert!(b.partner().is_none());

        drop(b);
        assert!(!registry.contains("room1"));
        assert_eq!(registry.room_count(), 0);

        // A fresh register on the same id starts over
        let again = registry.join("room1", RecordingSink::shared()).unwrap();
        assert!(!again.is_existing_peer());
    }

    #[test]
    fn test_leave_is_idempotent() {
        let registry = Arc::new(RoomRegistry::new());
        let a = registry.join("room1", RecordingSink::shared()).unwrap();
        let peer_id = a.peer_id();
        std::mem::forget(a);

        let first = registry.leave("room1", peer_id);
        assert!(first.removed);
        assert!(first.room_deleted);

        let second = registry.leave("room1", peer_id);
        assert!(!second.removed);
        assert!(!second.room_deleted);
    }

    #[test]
    fn test_concurrent_joins_never_exceed_two() {
        let registry = Arc::new(RoomRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.join("busy", RecordingSink::shared()).ok())
            })
            .collect();

        let members: Vec<RoomMembership> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(members.len(), 2);
        assert_eq!(registry.occupancy("busy"), 2);
        assert_eq!(members.iter().filter(|m| m.is_existing_peer()).count(), 1);
        assert_eq!(registry.peer_count(), 2);
    }
}
