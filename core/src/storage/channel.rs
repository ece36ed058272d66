//! A channel: one consumer group's copy of a topic's message stream.
//!
//! All queue state lives behind a single per-channel mutex so that dequeue,
//! in-flight bookkeeping and the scanner's expiry pass never race each other.
//! Different channels never share a lock.

use super::pqueue::DeadlineQueue;
use super::{Admission, ClientId, Consumer, StoreError, StoreSettings};
use crate::protocol::{Message, MessageId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

const EPHEMERAL_SUFFIX: &str = "#ephemeral";

#[derive(Debug)]
struct InFlightEntry {
    message: Message,
    owner: ClientId,
    deadline: Instant,
    delivered_at: Instant,
}

#[derive(Debug)]
struct DeferredEntry {
    message: Message,
    ready_at: Instant,
}

#[derive(Debug, Default)]
struct ChannelState {
    ready: VecDeque<Message>,
    in_flight: HashMap<MessageId, InFlightEntry>,
    in_flight_deadlines: DeadlineQueue,
    deferred: HashMap<MessageId, DeferredEntry>,
    deferred_deadlines: DeadlineQueue,
}

impl ChannelState {
    fn defer(&mut self, message: Message, ready_at: Instant) {
        self.deferred_deadlines.push(ready_at, message.id);
        self.deferred.insert(message.id, DeferredEntry { message, ready_at });
    }
}

/// Point-in-time view of a channel's queues
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub depth: usize,
    pub in_flight: usize,
    pub deferred: usize,
    pub consumers: usize,
    pub message_count: u64,
    pub requeue_count: u64,
    pub timeout_count: u64,
}

pub struct Channel {
    topic_name: String,
    name: String,
    ephemeral: bool,
    settings: StoreSettings,
    state: Mutex<ChannelState>,
    ready_notify: Notify,
    consumers: DashMap<ClientId, Arc<dyn Consumer>>,
    exiting: AtomicBool,
    message_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic_name)
            .field("name", &self.name)
            .field("exiting", &self.is_exiting())
            .finish()
    }
}

impl Channel {
    pub fn new(topic_name: &str, name: &str, settings: StoreSettings) -> Self {
        Self {
            topic_name: topic_name.to_string(),
            name: name.to_string(),
            ephemeral: name.ends_with(EPHEMERAL_SUFFIX),
            settings,
            state: Mutex::new(ChannelState::default()),
            ready_notify: Notify::new(),
            consumers: DashMap::new(),
            exiting: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_exiting() {
            return Err(StoreError::ChannelExiting(self.name.clone()));
        }
        Ok(())
    }

    fn warn_if_deep(&self, depth: usize) {
        if depth == self.settings.mem_queue_size + 1 {
            warn!(
                "Channel {}/{} backlog exceeded mem_queue_size ({})",
                self.topic_name, self.name, self.settings.mem_queue_size
            );
        }
    }

    /// Append a message to the ready queue
    pub fn put(&self, message: Message) -> Result<(), StoreError> {
        self.ensure_open()?;
        let depth = {
            let mut state = self.state.lock();
            state.ready.push_back(message);
            state.ready.len()
        };
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.warn_if_deep(depth);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Append a batch under one lock acquisition
    pub fn put_many(&self, messages: Vec<Message>) -> Result<(), StoreError> {
        self.ensure_open()?;
        let count = messages.len() as u64;
        let depth = {
            let mut state = self.state.lock();
            state.ready.extend(messages);
            state.ready.len()
        };
        self.message_count.fetch_add(count, Ordering::Relaxed);
        if depth > self.settings.mem_queue_size {
            debug!(
                "Channel {}/{} depth {} above mem_queue_size",
                self.topic_name, self.name, depth
            );
        }
        self.ready_notify.notify_waiters();
        Ok(())
    }

    /// Hold a message back until `delay` has elapsed
    pub fn put_deferred(&self, message: Message, delay: Duration) -> Result<(), StoreError> {
        if delay.is_zero() {
            return self.put(message);
        }
        self.ensure_open()?;
        self.state.lock().defer(message, Instant::now() + delay);
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Hand the head of the ready queue to `owner` if `gate` admits it.
    ///
    /// The gate runs under the channel lock, so a credit check made inside it
    /// is atomic with the dequeue. `Admission::Drop` discards the head and
    /// moves on to the next message.
    pub fn try_deliver<F>(&self, owner: ClientId, timeout: Duration, gate: &mut F) -> Option<Message>
    where
        F: FnMut(&Message) -> Admission,
    {
        if self.is_exiting() {
            return None;
        }
        let mut state = self.state.lock();
        loop {
            let admission = match state.ready.front() {
                Some(head) => gate(head),
                None => return None,
            };
            match admission {
                Admission::Hold => return None,
                Admission::Drop => {
                    state.ready.pop_front();
                }
                Admission::Deliver => {
                    let mut message = state.ready.pop_front()?;
                    message.attempts = message.attempts.saturating_add(1);

                    let now = Instant::now();
                    let deadline = now + timeout;
                    state.in_flight_deadlines.push(deadline, message.id);
                    state.in_flight.insert(
                        message.id,
                        InFlightEntry {
                            message: message.clone(),
                            owner,
                            deadline,
                            delivered_at: now,
                        },
                    );
                    return Some(message);
                }
            }
        }
    }

    /// Wait until a message can be delivered to `owner`.
    ///
    /// Returns `None` when the gate holds the head back or the channel is
    /// closing; the caller re-evaluates its own state before calling again.
    pub async fn next_ready<F>(&self, owner: ClientId, timeout: Duration, mut gate: F) -> Option<Message>
    where
        F: FnMut(&Message) -> Admission,
    {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_exiting() {
                return None;
            }
            if let Some(message) = self.try_deliver(owner, timeout, &mut gate) {
                return Some(message);
            }
            if !self.state.lock().ready.is_empty() {
                // Head was held back by the gate
                return None;
            }
            notified.await;
        }
    }

    fn take_in_flight(&self, state: &mut ChannelState, id: &MessageId, owner: ClientId) -> Result<InFlightEntry, StoreError> {
        match state.in_flight.get(id) {
            None => Err(StoreError::MessageNotInFlight(*id)),
            Some(entry) if entry.owner != owner => Err(StoreError::NotOwner { id: *id, owner }),
            Some(_) => state
                .in_flight
                .remove(id)
                .ok_or(StoreError::MessageNotInFlight(*id)),
        }
    }

    /// Acknowledge a delivered message
    pub fn finish(&self, id: &MessageId, owner: ClientId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        self.take_in_flight(&mut state, id, owner)?;
        let live = state.in_flight.len();
        let ChannelState {
            in_flight,
            in_flight_deadlines,
            ..
        } = &mut *state;
        in_flight_deadlines.compact(live, |deadline, id| {
            in_flight.get(id).is_some_and(|e| e.deadline == deadline)
        });
        Ok(())
    }

    /// Return an in-flight message to the channel, immediately or after `delay`
    pub fn requeue(&self, id: &MessageId, owner: ClientId, delay: Duration) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            let entry = self.take_in_flight(&mut state, id, owner)?;
            if delay.is_zero() {
                state.ready.push_back(entry.message);
            } else {
                state.defer(entry.message, Instant::now() + delay);
            }
        }
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
        if delay.is_zero() {
            self.ready_notify.notify_waiters();
        }
        Ok(())
    }

    /// Push an in-flight deadline out by `timeout`, never past
    /// `delivered_at + max_msg_timeout`
    pub fn touch(&self, id: &MessageId, owner: ClientId, timeout: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let max_msg_timeout = self.settings.max_msg_timeout;
        let entry = match state.in_flight.get_mut(id) {
            None => return Err(StoreError::MessageNotInFlight(*id)),
            Some(entry) if entry.owner != owner => {
                return Err(StoreError::NotOwner { id: *id, owner })
            }
            Some(entry) => entry,
        };
        let cap = entry.delivered_at + max_msg_timeout;
        let deadline = (Instant::now() + timeout).min(cap);
        entry.deadline = deadline;
        state.in_flight_deadlines.push(deadline, *id);
        Ok(())
    }

    /// Requeue every message in flight to `owner`, used when its session ends
    pub fn requeue_owned(&self, owner: ClientId) -> usize {
        let count = {
            let mut state = self.state.lock();
            let ids: Vec<MessageId> = state
                .in_flight
                .iter()
                .filter(|(_, e)| e.owner == owner)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                if let Some(entry) = state.in_flight.remove(id) {
                    state.ready.push_back(entry.message);
                }
            }
            ids.len()
        };
        if count > 0 {
            self.requeue_count.fetch_add(count as u64, Ordering::Relaxed);
            self.ready_notify.notify_waiters();
        }
        count
    }

    /// Requeue in-flight messages whose deadline has passed. Returns how many
    /// were moved.
    pub fn process_in_flight(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some((deadline, id)) = state.in_flight_deadlines.pop_due(now) {
                let current = match state.in_flight.get(&id) {
                    Some(entry) => entry.deadline == deadline,
                    None => false,
                };
                if !current {
                    continue;
                }
                if let Some(entry) = state.in_flight.remove(&id) {
                    expired.push((entry.owner, id));
                    state.ready.push_back(entry.message);
                }
            }
        }

        if expired.is_empty() {
            return 0;
        }
        self.timeout_count
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        self.ready_notify.notify_waiters();

        for (owner, id) in &expired {
            if let Some(consumer) = self.consumers.get(owner) {
                consumer.timed_out(id);
            }
        }
        expired.len()
    }

    /// Move deferred messages whose ready-at has passed into the ready queue
    pub fn process_deferred(&self, now: Instant) -> usize {
        let mut moved = 0;
        {
            let mut state = self.state.lock();
            while let Some((ready_at, id)) = state.deferred_deadlines.pop_due(now) {
                let current = state
                    .deferred
                    .get(&id)
                    .is_some_and(|e| e.ready_at == ready_at);
                if !current {
                    continue;
                }
                if let Some(entry) = state.deferred.remove(&id) {
                    state.ready.push_back(entry.message);
                    moved += 1;
                }
            }
        }
        if moved > 0 {
            self.ready_notify.notify_waiters();
        }
        moved
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.consumers.insert(consumer.id(), consumer);
        Ok(())
    }

    /// Remove a consumer and return how many remain
    pub fn remove_consumer(&self, id: ClientId) -> usize {
        self.consumers.remove(&id);
        self.consumers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn depth(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    pub fn is_in_flight(&self, id: &MessageId) -> bool {
        self.state.lock().in_flight.contains_key(id)
    }

    pub fn stats(&self) -> ChannelStats {
        let state = self.state.lock();
        ChannelStats {
            depth: state.ready.len(),
            in_flight: state.in_flight.len(),
            deferred: state.deferred.len(),
            consumers: self.consumers.len(),
            message_count: self.message_count.load(Ordering::Relaxed),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
        }
    }

    /// Stop the channel: close every consumer and fold in-flight and
    /// deferred messages back into the ready queue.
    pub fn close(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing channel {}/{}", self.topic_name, self.name);

        let consumers: Vec<Arc<dyn Consumer>> =
            self.consumers.iter().map(|c| c.value().clone()).collect();
        for consumer in consumers {
            consumer.close();
        }

        {
            let mut state = self.state.lock();
            let in_flight: Vec<InFlightEntry> = state.in_flight.drain().map(|(_, e)| e).collect();
            let deferred: Vec<DeferredEntry> = state.deferred.drain().map(|(_, e)| e).collect();
            state.ready.extend(in_flight.into_iter().map(|e| e.message));
            state.ready.extend(deferred.into_iter().map(|e| e.message));
            state.in_flight_deadlines.clear();
            state.deferred_deadlines.clear();
        }
        self.ready_notify.notify_waiters();
    }
}
