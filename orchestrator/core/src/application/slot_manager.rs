// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Slot Manager
//!
//! Bounded-concurrency admission controller for inference slots.
//!
//! All pool state (`active`, `waiting`) sits behind one lock and is only
//! reachable through `enqueue`/`acquire`, `release`, `queue_position` and the
//! read-only `snapshot`. Every mutation promotes waiters eagerly, so a
//! non-empty wait queue always means the pool is full.
//!
//! Ordering is queue order, not preemption: `User` tickets are granted ahead
//! of `Background` tickets, FIFO within a class; a running `Background`
//! request keeps its slot until it releases.
//!
//! Release is tied to scope: [`SlotGuard`] releases on drop and a dropped
//! [`PendingAdmission`] leaves the queue (or gives back a slot it was granted
//! in the meantime).

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::admission::{
    AdmissionError, AdmissionTicket, PriorityClass, RequestId, SlotPoolSnapshot, TicketState,
};

struct Waiter {
    ticket: AdmissionTicket,
    notify: oneshot::Sender<()>,
}

struct PoolState {
    capacity: usize,
    active: HashMap<RequestId, AdmissionTicket>,
    /// Sorted by (priority class, arrival)
    waiting: Vec<Waiter>,
    closed: bool,
}

impl PoolState {
    fn position_of(&self, request_id: RequestId) -> Option<usize> {
        self.waiting
            .iter()
            .position(|w| w.ticket.request_id == request_id)
    }

    fn insert_waiter(&mut self, waiter: Waiter) {
        let class = waiter.ticket.priority_class;
        let index = self
            .waiting
            .iter()
            .position(|w| w.ticket.priority_class > class)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(index, waiter);
    }

    fn promote(&mut self) {
        while self.active.len() < self.capacity && !self.waiting.is_empty() {
            let Waiter { mut ticket, notify } = self.waiting.remove(0);
            ticket.state = TicketState::Granted;
            let request_id = ticket.request_id;
            self.active.insert(request_id, ticket);
            if notify.send(()).is_err() {
                // Waiter vanished between dequeue and grant
                self.active.remove(&request_id);
                debug!(request_id = %request_id, "Promoted waiter was gone; slot returned");
                continue;
            }
            debug!(request_id = %request_id, "Queued request promoted to active slot");
        }
    }

    fn snapshot(&self) -> SlotPoolSnapshot {
        let waiting_user = self
            .waiting
            .iter()
            .filter(|w| w.ticket.priority_class == PriorityClass::User)
            .count();
        SlotPoolSnapshot {
            capacity: self.capacity,
            active: self.active.len(),
            waiting_user,
            waiting_background: self.waiting.len() - waiting_user,
        }
    }
}

pub struct SlotManager {
    state: Mutex<PoolState>,
}

impl SlotManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                capacity: capacity.max(1),
                active: HashMap::new(),
                waiting: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Registers a request with the pool without waiting. The returned handle
    /// reports queue position and resolves once the slot is granted.
    pub fn enqueue(
        self: &Arc<Self>,
        request_id: RequestId,
        priority_class: PriorityClass,
    ) -> Result<PendingAdmission, AdmissionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AdmissionError::Unavailable);
        }
        if state.active.contains_key(&request_id) || state.position_of(request_id).is_some() {
            return Err(AdmissionError::Duplicate(request_id));
        }

        let mut ticket = AdmissionTicket {
            request_id,
            priority_class,
            enqueued_at: Utc::now(),
            state: TicketState::Queued,
        };

        let receiver = if state.active.len() < state.capacity {
            ticket.state = TicketState::Granted;
            state.active.insert(request_id, ticket);
            debug!(request_id = %request_id, class = priority_class.as_str(), "Slot granted immediately");
            None
        } else {
            let (notify, receiver) = oneshot::channel();
            state.insert_waiter(Waiter { ticket, notify });
            debug!(
                request_id = %request_id,
                class = priority_class.as_str(),
                position = state.position_of(request_id).unwrap_or(0),
                "Request queued for slot"
            );
            Some(receiver)
        };
        record_gauges(&state.snapshot());
        drop(state);

        Ok(PendingAdmission {
            manager: Arc::clone(self),
            request_id,
            enqueued: Instant::now(),
            receiver,
            settled: false,
        })
    }

    /// Waits for a slot. Fails only when the pool shuts down.
    pub async fn acquire(
        self: &Arc<Self>,
        request_id: RequestId,
        priority_class: PriorityClass,
    ) -> Result<SlotGuard, AdmissionError> {
        let mut pending = self.enqueue(request_id, priority_class)?;
        pending.granted().await
    }

    /// Gives back a slot or leaves the queue. Idempotent; returns whether the
    /// request was known to the pool.
    pub fn release(&self, request_id: RequestId) -> bool {
        let mut state = self.state.lock();
        let known = if state.active.remove(&request_id).is_some() {
            state.promote();
            true
        } else if let Some(index) = state.position_of(request_id) {
            state.waiting.remove(index);
            true
        } else {
            false
        };
        if known {
            record_gauges(&state.snapshot());
            debug!(request_id = %request_id, "Slot ticket released");
        }
        known
    }

    /// 0-based index in the wait queue; 0 once granted (or unknown).
    /// Non-increasing within a class. A queued Background ticket moves back
    /// one place for every User ticket that arrives after it.
    pub fn queue_position(&self, request_id: RequestId) -> usize {
        self.state.lock().position_of(request_id).unwrap_or(0)
    }

    pub fn snapshot(&self) -> SlotPoolSnapshot {
        self.state.lock().snapshot()
    }

    /// Refuses new work and fails every queued acquire with `Unavailable`.
    /// Active slots run to completion.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.waiting.len();
        // Dropping the senders wakes every waiter with a closed channel
        state.waiting.clear();
        record_gauges(&state.snapshot());
        info!(dropped_waiters = dropped, "Slot manager shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn record_gauges(snapshot: &SlotPoolSnapshot) {
    metrics::gauge!("aegis_chat_slots_active").set(snapshot.active as f64);
    metrics::gauge!("aegis_chat_queue_depth", "class" => "user").set(snapshot.waiting_user as f64);
    metrics::gauge!("aegis_chat_queue_depth", "class" => "background")
        .set(snapshot.waiting_background as f64);
}

/// A request registered with the pool that has not yet been handed its
/// [`SlotGuard`]. Dropping it withdraws the request.
pub struct PendingAdmission {
    manager: Arc<SlotManager>,
    request_id: RequestId,
    enqueued: Instant,
    receiver: Option<oneshot::Receiver<()>>,
    settled: bool,
}

impl PendingAdmission {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn position(&self) -> usize {
        self.manager.queue_position(self.request_id)
    }

    /// Resolves once the slot is granted. Cancel-safe: can be polled again
    /// from a `select!` loop after another branch fires.
    pub async fn granted(&mut self) -> Result<SlotGuard, AdmissionError> {
        if let Some(receiver) = self.receiver.as_mut() {
            if receiver.await.is_err() {
                self.receiver = None;
                self.settled = true;
                warn!(request_id = %self.request_id, "Queued request dropped: slot pool unavailable");
                return Err(AdmissionError::Unavailable);
            }
            self.receiver = None;
        }
        self.settled = true;

        let queue_wait = self.enqueued.elapsed();
        metrics::histogram!("aegis_chat_queue_wait_seconds").record(queue_wait.as_secs_f64());
        Ok(SlotGuard {
            manager: Arc::clone(&self.manager),
            request_id: self.request_id,
            queue_wait,
        })
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if !self.settled {
            self.manager.release(self.request_id);
        }
    }
}

/// Scoped ownership of one active slot; the slot is released when the guard
/// goes out of scope on any exit path.
pub struct SlotGuard {
    manager: Arc<SlotManager>,
    request_id: RequestId,
    queue_wait: Duration,
}

impl SlotGuard {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn queue_wait(&self) -> Duration {
        self.queue_wait
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.manager.release(self.request_id);
    }
}

#[cfg(test)]
impl SlotManager {
    fn ticket(&self, request_id: RequestId) -> Option<AdmissionTicket> {
        let state = self.state.lock();
        state.active.get(&request_id).cloned().or_else(|| {
            state
                .waiting
                .iter()
                .find(|w| w.ticket.request_id == request_id)
                .map(|w| w.ticket.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn manager(capacity: usize) -> Arc<SlotManager> {
        Arc::new(SlotManager::new(capacity))
    }

    #[tokio::test]
    async fn test_grants_immediately_under_capacity() {
        let slots = manager(2);
        let a = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let b = slots.acquire(RequestId::new(), PriorityClass::Background).await.unwrap();
        assert_eq!(slots.snapshot().active, 2);
        assert_eq!(slots.queue_position(a.request_id()), 0);
        drop(a);
        drop(b);
        assert_eq!(slots.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_active_never_exceeds_capacity() {
        let slots = manager(2);
        let mut guards = Vec::new();
        let mut pending = Vec::new();
        for i in 0..6 {
            let class = if i % 2 == 0 { PriorityClass::User } else { PriorityClass::Background };
            let mut p = slots.enqueue(RequestId::new(), class).unwrap();
            if slots.ticket(p.request_id()).map(|t| t.state) == Some(TicketState::Granted) {
                guards.push(p.granted().await.unwrap());
            } else {
                pending.push(p);
            }
            assert!(slots.snapshot().active <= 2);
        }
        assert_eq!(guards.len(), 2);
        assert_eq!(slots.snapshot().waiting(), 4);

        while let Some(guard) = guards.pop() {
            drop(guard);
            assert!(slots.snapshot().active <= 2);
        }
        assert_eq!(slots.snapshot().active, 2);
        assert_eq!(slots.snapshot().waiting(), 2);
    }

    #[tokio::test]
    async fn test_user_before_background_and_fifo_within_class() {
        let slots = manager(1);
        let holder = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();

        let bg1 = slots.enqueue(RequestId::new(), PriorityClass::Background).unwrap();
        let user1 = slots.enqueue(RequestId::new(), PriorityClass::User).unwrap();
        let bg2 = slots.enqueue(RequestId::new(), PriorityClass::Background).unwrap();
        let user2 = slots.enqueue(RequestId::new(), PriorityClass::User).unwrap();

        assert_eq!(user1.position(), 0);
        assert_eq!(user2.position(), 1);
        assert_eq!(bg1.position(), 2);
        assert_eq!(bg2.position(), 3);

        drop(holder);
        let state = slots.ticket(user1.request_id()).unwrap().state;
        assert_eq!(state, TicketState::Granted);
        assert_eq!(bg1.position(), 1);
    }

    #[tokio::test]
    async fn test_scenario_background_waits_without_preemption() {
        let slots = manager(2);
        let a = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let b = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let mut c = slots.enqueue(RequestId::new(), PriorityClass::Background).unwrap();

        assert_eq!(c.position(), 0);
        assert_eq!(slots.ticket(c.request_id()).unwrap().state, TicketState::Queued);
        assert_eq!(slots.snapshot().active, 2);

        drop(a);
        let c_guard = c.granted().await.unwrap();
        assert_eq!(slots.queue_position(c_guard.request_id()), 0);
        assert_eq!(slots.snapshot().active, 2);
        drop(b);
        drop(c_guard);
        assert_eq!(slots.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_queue_position_is_non_increasing() {
        let slots = manager(1);
        let mut holder = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let mut queue: VecDeque<PendingAdmission> = (0..4)
            .map(|_| slots.enqueue(RequestId::new(), PriorityClass::User).unwrap())
            .collect();
        let tracked = queue.back().unwrap().request_id();
        let mut last = slots.queue_position(tracked);
        assert_eq!(last, 3);

        // Later arrivals of the same class queue behind it
        let _late: Vec<PendingAdmission> = (0..2)
            .map(|_| slots.enqueue(RequestId::new(), PriorityClass::User).unwrap())
            .collect();
        assert_eq!(slots.queue_position(tracked), last);

        loop {
            drop(holder);
            let mut head = queue.pop_front().unwrap();
            holder = head.granted().await.unwrap();
            let position = slots.queue_position(tracked);
            assert!(position <= last);
            last = position;
            if holder.request_id() == tracked {
                assert_eq!(position, 0);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_later_user_arrival_moves_background_back() {
        let slots = manager(1);
        let holder = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let background = slots.enqueue(RequestId::new(), PriorityClass::Background).unwrap();
        assert_eq!(background.position(), 0);

        let user = slots.enqueue(RequestId::new(), PriorityClass::User).unwrap();
        assert_eq!(user.position(), 0);
        assert_eq!(background.position(), 1);

        drop(holder);
        assert_eq!(slots.ticket(user.request_id()).unwrap().state, TicketState::Granted);
        assert_eq!(background.position(), 0);
    }

    #[tokio::test]
    async fn test_dropping_pending_withdraws_from_queue() {
        let slots = manager(1);
        let _holder = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let first = slots.enqueue(RequestId::new(), PriorityClass::User).unwrap();
        let second = slots.enqueue(RequestId::new(), PriorityClass::User).unwrap();
        assert_eq!(second.position(), 1);

        drop(first);
        assert_eq!(second.position(), 0);
        assert_eq!(slots.snapshot().waiting(), 1);
    }

    #[tokio::test]
    async fn test_granted_but_unclaimed_slot_is_returned_on_drop() {
        let slots = manager(1);
        let holder = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let pending = slots.enqueue(RequestId::new(), PriorityClass::User).unwrap();
        drop(holder);
        assert_eq!(slots.ticket(pending.request_id()).unwrap().state, TicketState::Granted);
        drop(pending);
        assert_eq!(slots.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let slots = manager(1);
        let id = RequestId::new();
        let guard = slots.acquire(id, PriorityClass::User).await.unwrap();
        assert!(slots.release(id));
        assert!(!slots.release(id));
        drop(guard);
        assert_eq!(slots.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected() {
        let slots = manager(1);
        let id = RequestId::new();
        let _guard = slots.acquire(id, PriorityClass::User).await.unwrap();
        assert!(matches!(
            slots.enqueue(id, PriorityClass::User),
            Err(AdmissionError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_new_requests() {
        let slots = manager(1);
        let _holder = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let mut queued = slots.enqueue(RequestId::new(), PriorityClass::User).unwrap();

        slots.shutdown();
        assert_eq!(queued.granted().await.err(), Some(AdmissionError::Unavailable));
        assert_eq!(
            slots.enqueue(RequestId::new(), PriorityClass::User).err(),
            Some(AdmissionError::Unavailable)
        );
        assert_eq!(slots.snapshot().active, 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release_from_other_task() {
        let slots = manager(1);
        let holder = slots.acquire(RequestId::new(), PriorityClass::User).await.unwrap();
        let waiter_slots = slots.clone();
        let waiter = tokio::spawn(async move {
            waiter_slots
                .acquire(RequestId::new(), PriorityClass::Background)
                .await
                .map(|g| g.request_id())
        });
        tokio::task::yield_now().await;
        drop(holder);
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(slots.queue_position(granted), 0);
    }
}
