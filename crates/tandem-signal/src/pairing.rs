//! Matchmaking: pair two waiting endpoints and hand both the same room id
//!
//! The queue is a bounded FIFO guarded by one mutex. An arrival first tries to
//! take the oldest live waiter; failing that it enqueues itself and suspends on
//! a oneshot until a later arrival pairs with it. The whole take-or-enqueue step
//! runs under the lock, so two arrivals can never claim the same waiter.
//!
//! Waiters are identified by their queue ticket. The client-supplied user id is
//! unverified and only echoed back, so it never decides who pairs with whom.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use tandem_core::ids::generate_room_id;
use tandem_core::SignalError;

/// Attempts at drawing a room id not already in use
const ROOM_ID_ATTEMPTS: usize = 8;

/// A completed pairing, as seen by one side
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pairing {
    pub room_id: String,
    /// This side's own submitted user id
    pub user_id: String,
    /// User id the partner claimed; unverified
    pub partner_user_id: String,
    pub paired_at: DateTime<Utc>,
}

struct Waiter {
    ticket: u64,
    user_id: String,
    enqueued_at: Instant,
    tx: oneshot::Sender<Pairing>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<Waiter>,
    next_ticket: u64,
}

/// Outcome of [`PairingQueue::register`]
#[derive(Debug)]
pub enum Registration {
    /// A waiter was available; both sides now share a room id
    Paired(Pairing),
    /// Nobody was waiting; await the handle for a partner
    Waiting(WaitHandle),
}

/// Bounded FIFO of endpoints awaiting a partner
pub struct PairingQueue {
    state: Arc<Mutex<QueueState>>,
    capacity: usize,
}

impl PairingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            capacity,
        }
    }

    /// Pair `user_id` with the oldest live waiter, or enqueue it
    ///
    /// `in_use` reports room ids that are currently live, so a fresh pairing
    /// never lands in an occupied room. A capacity of zero turns every
    /// arrival that finds nobody waiting away.
    pub fn register(
        &self,
        user_id: &str,
        in_use: impl Fn(&str) -> bool,
    ) -> Result<Registration, SignalError> {
        let mut state = self.state.lock();

        while !state.waiting.is_empty() {
            let room_id = fresh_room_id(&in_use)?;
            let Some(waiter) = state.waiting.pop_front() else {
                break;
            };
            let paired_at = Utc::now();
            let theirs = Pairing {
                room_id: room_id.clone(),
                user_id: waiter.user_id.clone(),
                partner_user_id: user_id.to_string(),
                paired_at,
            };

            // A dropped receiver means the waiter went away; try the next one
            if waiter.tx.send(theirs).is_err() {
                debug!("Skipping abandoned waiter {}", waiter.user_id);
                continue;
            }

            info!(
                "Paired {} with {} in room {} (waited {:?})",
                user_id,
                waiter.user_id,
                room_id,
                waiter.enqueued_at.elapsed()
            );
            return Ok(Registration::Paired(Pairing {
                room_id,
                user_id: user_id.to_string(),
                partner_user_id: waiter.user_id,
                paired_at,
            }));
        }

        if state.waiting.len() >= self.capacity {
            return Err(SignalError::QueueFull {
                capacity: self.capacity,
            });
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        state.waiting.push_back(Waiter {
            ticket,
            user_id: user_id.to_string(),
            enqueued_at: Instant::now(),
            tx,
        });
        debug!("User {} waiting for a partner ({} queued)", user_id, state.waiting.len());

        Ok(Registration::Waiting(WaitHandle {
            ticket,
            rx,
            state: Arc::clone(&self.state),
        }))
    }

    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn fresh_room_id(in_use: &impl Fn(&str) -> bool) -> Result<String, SignalError> {
    for _ in 0..ROOM_ID_ATTEMPTS {
        let id = generate_room_id()
            .map_err(|e| SignalError::Internal(format!("RNG failed: {}", e)))?;
        if !in_use(&id) {
            return Ok(id);
        }
    }
    Err(SignalError::Internal("could not allocate a free room id".into()))
}

/// A queued registration
///
/// Dropping the handle withdraws it from the queue, so a waiter that goes away
/// can never be matched afterwards.
pub struct WaitHandle {
    ticket: u64,
    rx: oneshot::Receiver<Pairing>,
    state: Arc<Mutex<QueueState>>,
}

impl WaitHandle {
    /// Wait for a partner. Cancel-safe: may be polled again after being dropped
    /// from a `select!`.
    pub async fn paired(&mut self) -> Result<Pairing, SignalError> {
        (&mut self.rx).await.map_err(|_| SignalError::Disconnected)
    }
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiting.iter().position(|w| w.ticket == self.ticket) {
            let waiter = state.waiting.remove(pos);
            if let Some(waiter) = waiter {
                debug!("User {} withdrew from matchmaking", waiter.user_id);
            }
        }
    }
}
