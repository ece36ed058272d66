//! Per-connection session state shared by the input loop and the pump.
//!
//! Credit is an atomic counter, the in-flight set has its own lock and the
//! subscription is write-once, so the two tasks never need a
//! connection-wide lock.

use crate::protocol::{Identity, MessageId};
use crate::storage::{Channel, ClientId, Consumer};
use crate::topic_manager::TopicManager;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    AwaitingIdentity = 0,
    Ready = 1,
    Subscribed = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::AwaitingIdentity,
            1 => SessionState::Ready,
            2 => SessionState::Subscribed,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

pub struct ClientSession {
    id: ClientId,
    remote_addr: SocketAddr,
    state: AtomicU8,
    identity: OnceLock<Identity>,
    subscription: OnceLock<Arc<Channel>>,
    credit: AtomicI64,
    credit_granted: AtomicBool,
    in_flight: Mutex<HashSet<MessageId>>,
    last_activity: Mutex<Instant>,
    wake: Notify,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("credit", &self.credit())
            .finish()
    }
}

impl ClientSession {
    pub fn new(id: ClientId, remote_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            remote_addr,
            state: AtomicU8::new(SessionState::AwaitingIdentity as u8),
            identity: OnceLock::new(),
            subscription: OnceLock::new(),
            credit: AtomicI64::new(0),
            credit_granted: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            wake: Notify::new(),
            cancel,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
        self.wake.notify_one();
    }

    /// Record negotiated capabilities; only the first call takes effect
    pub fn identify(&self, identity: Identity) -> bool {
        if self.identity.set(identity).is_err() {
            return false;
        }
        self.set_state(SessionState::Ready);
        true
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// In-flight timeout for messages delivered on this session
    pub fn msg_timeout(&self, default: Duration) -> Duration {
        self.identity().map(|i| i.msg_timeout).unwrap_or(default)
    }

    /// Bind the session to a channel. Fails if it is already bound.
    pub fn subscribe(&self, channel: Arc<Channel>) -> Result<(), Arc<Channel>> {
        self.subscription.set(channel)?;
        self.set_state(SessionState::Subscribed);
        Ok(())
    }

    pub fn channel(&self) -> Option<&Arc<Channel>> {
        self.subscription.get()
    }

    pub fn start_close(&self) {
        self.set_state(SessionState::Closing);
    }

    /// Replace the delivery credit
    pub fn set_ready(&self, count: i64) {
        self.credit.store(count, Ordering::Release);
        self.credit_granted.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn credit(&self) -> i64 {
        self.credit.load(Ordering::Acquire)
    }

    /// Whether the client has sent RDY at least once
    pub fn credit_granted(&self) -> bool {
        self.credit_granted.load(Ordering::Acquire)
    }

    /// Take one unit of credit. Fails when credit is exhausted or the
    /// session is not in a delivering state.
    pub fn try_consume_credit(&self) -> bool {
        if self.state() != SessionState::Subscribed {
            return false;
        }
        let mut current = self.credit.load(Ordering::Acquire);
        while current > 0 {
            match self.credit.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Subscribed, holding credit and bound to a live channel
    pub fn can_receive(&self) -> bool {
        self.state() == SessionState::Subscribed
            && self.credit() > 0
            && self.channel().is_some_and(|c| !c.is_exiting())
    }

    pub fn record_in_flight(&self, id: MessageId) {
        self.in_flight.lock().insert(id);
    }

    pub fn remove_in_flight(&self, id: &MessageId) -> bool {
        self.in_flight.lock().remove(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Wake the pump so it re-reads credit and state
    pub fn wake_pump(&self) {
        self.wake.notify_one();
    }

    pub async fn woken(&self) {
        self.wake.notified().await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Force both connection loops to stop
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Return everything still in flight to the channel and leave it.
    /// Returns how many messages were requeued.
    pub fn release(&self, topics: &TopicManager) -> usize {
        self.set_state(SessionState::Closed);
        self.cancel.cancel();

        let Some(channel) = self.channel() else {
            return 0;
        };
        let requeued = channel.requeue_owned(self.id);
        self.in_flight.lock().clear();
        topics.release_channel(channel, self.id);
        debug!(
            "Client {} released {}/{} with {} messages requeued",
            self.remote_addr,
            channel.topic_name(),
            channel.name(),
            requeued
        );
        requeued
    }
}

impl Consumer for ClientSession {
    fn id(&self) -> ClientId {
        self.id
    }

    fn timed_out(&self, id: &MessageId) {
        self.remove_in_flight(id);
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::protocol::{IdentifyRequest, Message};
    use crate::storage::Admission;

    fn session(id: ClientId) -> Arc<ClientSession> {
        Arc::new(ClientSession::new(
            id,
            "127.0.0.1:5000".parse().unwrap(),
            CancellationToken::new(),
        ))
    }

    fn identity() -> Identity {
        IdentifyRequest::default()
            .negotiate(&BrokerConfig::default(), false)
            .unwrap()
    }

    #[test]
    fn test_state_progression() {
        let topics = TopicManager::from_config(&BrokerConfig::default());
        let s = session(1);
        assert_eq!(s.state(), SessionState::AwaitingIdentity);

        assert!(s.identify(identity()));
        assert!(!s.identify(identity()));
        assert_eq!(s.state(), SessionState::Ready);

        let channel = topics.subscribe("t", "c", s.clone()).unwrap();
        s.subscribe(channel.clone()).unwrap();
        assert_eq!(s.state(), SessionState::Subscribed);
        assert!(s.subscribe(channel).is_err());

        s.start_close();
        assert_eq!(s.state(), SessionState::Closing);
    }

    #[test]
    fn test_credit_is_consumed_atomically() {
        let topics = TopicManager::from_config(&BrokerConfig::default());
        let s = session(1);
        s.identify(identity());
        // No delivery before the session is subscribed
        s.set_ready(2);
        assert!(!s.try_consume_credit());

        let channel = topics.subscribe("t", "c", s.clone()).unwrap();
        s.subscribe(channel).unwrap();
        assert!(s.can_receive());
        assert!(s.try_consume_credit());
        assert!(s.try_consume_credit());
        assert!(!s.try_consume_credit());
        assert!(!s.can_receive());
        assert_eq!(s.credit(), 0);
        assert!(s.credit_granted());

        s.set_ready(1);
        s.start_close();
        assert!(!s.try_consume_credit());
    }

    #[test]
    fn test_concurrent_consumers_never_overdraw() {
        let topics = TopicManager::from_config(&BrokerConfig::default());
        let s = session(1);
        s.identify(identity());
        let channel = topics.subscribe("t", "c", s.clone()).unwrap();
        s.subscribe(channel).unwrap();
        s.set_ready(1000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || (0..500).filter(|_| s.try_consume_credit()).count())
            })
            .collect();
        let taken: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(taken, 1000);
        assert_eq!(s.credit(), 0);
    }

    #[test]
    fn test_release_requeues_owned_messages() {
        let topics = TopicManager::from_config(&BrokerConfig::default());
        let s = session(7);
        s.identify(identity());
        let channel = topics.subscribe("t", "c", s.clone()).unwrap();
        s.subscribe(channel.clone()).unwrap();
        s.set_ready(3);

        for _ in 0..3 {
            topics.publish("t", bytes::Bytes::from_static(b"m")).unwrap();
        }
        let mut gate = |_: &Message| Admission::Deliver;
        while let Some(message) = channel.try_deliver(7, Duration::from_secs(30), &mut gate) {
            s.record_in_flight(message.id);
        }
        assert_eq!(s.in_flight_count(), 3);

        assert_eq!(s.release(&topics), 3);
        assert_eq!(channel.depth(), 3);
        assert_eq!(channel.in_flight_count(), 0);
        assert_eq!(channel.consumer_count(), 0);
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.is_cancelled());
    }

    #[test]
    fn test_channel_close_cancels_session() {
        let topics = TopicManager::from_config(&BrokerConfig::default());
        let s = session(1);
        let channel = topics.subscribe("t", "c", s.clone()).unwrap();
        channel.close();
        assert!(s.is_cancelled());
    }
}
