//! Per-connection message pump (the output loop).
//!
//! Runs beside the input loop over the same [`ClientSession`]. Each turn it
//! waits for whichever comes first: cancellation, a state or credit change,
//! a heartbeat tick, a buffered-output flush tick, or a message the channel
//! can hand over.

use super::session::ClientSession;
use super::writer::ConnectionWriter;
use crate::metrics::BrokerMetrics;
use crate::protocol::{Frame, Identity, Message};
use crate::storage::{Admission, Channel};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

pub struct MessagePump {
    session: Arc<ClientSession>,
    writer: ConnectionWriter,
    metrics: Arc<BrokerMetrics>,
    msg_timeout: Duration,
}

fn ticker(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    })
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Credit gate evaluated under the channel lock for the head message
fn admit(session: &ClientSession, sample_rate: u8) -> Admission {
    if sample_rate > 0 && rand::thread_rng().gen_range(0..100u8) >= sample_rate {
        return Admission::Drop;
    }
    if session.try_consume_credit() {
        Admission::Deliver
    } else {
        Admission::Hold
    }
}

impl MessagePump {
    pub fn new(
        session: Arc<ClientSession>,
        writer: ConnectionWriter,
        metrics: Arc<BrokerMetrics>,
        msg_timeout: Duration,
    ) -> Self {
        Self {
            session,
            writer,
            metrics,
            msg_timeout,
        }
    }

    async fn next_message(&self, channel: Option<&Arc<Channel>>, sample_rate: u8) -> Option<Message> {
        match channel {
            Some(channel) => {
                let session = &self.session;
                channel
                    .next_ready(session.id(), self.msg_timeout, |_: &Message| {
                        admit(session, sample_rate)
                    })
                    .await
            }
            None => std::future::pending().await,
        }
    }

    pub async fn run(self, identity: Identity) {
        let session = self.session.clone();
        let cancel = session.cancel_token().clone();
        let mut heartbeat = ticker(identity.heartbeat_interval);
        let mut flusher = ticker(identity.output_buffer_timeout);
        let unbuffered = identity.output_buffer_size == 0;
        let mut flushed = true;

        debug!(
            "Pump started for {} (heartbeat {:?}, sample rate {})",
            session.remote_addr(),
            identity.heartbeat_interval,
            identity.sample_rate
        );

        loop {
            let deliverable = session.can_receive();
            let channel = session.channel().cloned();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = session.woken() => Ok(()),
                _ = tick(&mut heartbeat) => {
                    trace!("Heartbeat to {}", session.remote_addr());
                    flushed = true;
                    self.writer.send(Frame::heartbeat()).await
                }
                _ = tick(&mut flusher), if !flushed => {
                    flushed = true;
                    self.writer.flush().await
                }
                message = self.next_message(channel.as_ref(), identity.sample_rate), if deliverable => {
                    match message {
                        Some(message) => {
                            session.record_in_flight(message.id);
                            self.metrics.record_delivered();
                            flushed = false;
                            self.writer.feed(Frame::message(message.encode())).await
                        }
                        None => Ok(()),
                    }
                }
            };

            let result = match result {
                Ok(()) if !flushed && (unbuffered || !self.more_to_send(channel.as_ref())) => {
                    flushed = true;
                    self.writer.flush().await
                }
                other => other,
            };

            if let Err(e) = result {
                if !cancel.is_cancelled() {
                    warn!("Write to {} failed, closing: {}", session.remote_addr(), e);
                    session.close();
                }
                break;
            }
        }

        debug!("Pump exiting for {}", session.remote_addr());
    }

    fn more_to_send(&self, channel: Option<&Arc<Channel>>) -> bool {
        self.session.can_receive() && channel.is_some_and(|c| c.depth() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::writer::BoxedStream;
    use crate::config::BrokerConfig;
    use crate::protocol::{FrameCodec, FrameType, IdentifyRequest};
    use crate::topic_manager::TopicManager;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};
    use tokio_util::sync::CancellationToken;

    struct Harness {
        topics: TopicManager,
        session: Arc<ClientSession>,
        reader: FramedRead<tokio::io::DuplexStream, FrameCodec>,
        pump: tokio::task::JoinHandle<()>,
    }

    fn start(identify: &str) -> Harness {
        let config = BrokerConfig::default();
        let topics = TopicManager::from_config(&config);
        let identity = IdentifyRequest::parse(identify.as_bytes())
            .unwrap()
            .negotiate(&config, false)
            .unwrap();

        let session = Arc::new(ClientSession::new(
            1,
            "127.0.0.1:4000".parse().unwrap(),
            CancellationToken::new(),
        ));
        session.identify(identity.clone());
        let channel = topics.subscribe("t", "c", session.clone()).unwrap();
        session.subscribe(channel).unwrap();

        let (server, client) = tokio::io::duplex(64 * 1024);
        let (_read, write) = tokio::io::split(Box::new(server) as BoxedStream);
        let writer = ConnectionWriter::new(
            FramedWrite::new(write, FrameCodec::default()),
            identity.output_buffer_size,
            session.cancel_token().clone(),
        );
        let pump = MessagePump::new(
            session.clone(),
            writer,
            Arc::new(BrokerMetrics::new()),
            Duration::from_secs(30),
        );
        let pump = tokio::spawn(pump.run(identity));

        Harness {
            topics,
            session,
            reader: FramedRead::new(client, FrameCodec::default()),
            pump,
        }
    }

    #[tokio::test]
    async fn test_delivers_up_to_credit() {
        let mut h = start(r#"{"heartbeat_interval":-1}"#);
        for body in ["a", "b", "c"] {
            h.topics.publish("t", Bytes::from(body)).unwrap();
        }
        h.session.set_ready(2);

        for expected in ["a", "b"] {
            let frame = h.reader.next().await.unwrap().unwrap();
            assert_eq!(frame.frame_type, FrameType::Message);
            let message = Message::decode(frame.payload).unwrap();
            assert_eq!(message.body, Bytes::from(expected));
            assert_eq!(message.attempts, 1);
        }

        // Third message stays queued until more credit arrives
        tokio::time::sleep(Duration::from_millis(50)).await;
        let channel = h.session.channel().unwrap().clone();
        assert_eq!(channel.depth(), 1);
        assert_eq!(h.session.in_flight_count(), 2);

        h.session.set_ready(1);
        let frame = h.reader.next().await.unwrap().unwrap();
        assert_eq!(Message::decode(frame.payload).unwrap().body, Bytes::from("c"));

        h.session.close();
        h.pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_at_negotiated_interval() {
        let mut h = start(r#"{"heartbeat_interval":1000}"#);
        let started = std::time::Instant::now();
        let frame = h.reader.next().await.unwrap().unwrap();
        assert!(frame.is_heartbeat());
        assert!(started.elapsed() >= Duration::from_millis(900));

        h.session.close();
        h.pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_closing_session_stops_delivery() {
        let mut h = start(r#"{"heartbeat_interval":-1}"#);
        h.session.set_ready(10);
        h.session.start_close();
        h.topics.publish("t", Bytes::from("late")).unwrap();

        let next = tokio::time::timeout(Duration::from_millis(100), h.reader.next()).await;
        assert!(next.is_err(), "no frame expected after CLS");

        h.session.close();
        h.pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_pump_stuck_on_a_full_socket() {
        let h = start(r#"{"heartbeat_interval":-1,"output_buffer_size":-1}"#);
        for _ in 0..8 {
            h.topics.publish("t", Bytes::from(vec![b'x'; 32 * 1024])).unwrap();
        }
        h.session.set_ready(8);

        // The reader never drains the 64 KiB pipe, so the pump is parked in a write
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.pump.is_finished());

        h.session.close();
        tokio::time::timeout(Duration::from_secs(1), h.pump)
            .await
            .expect("pump did not stop after close")
            .unwrap();
    }

    #[test]
    fn test_sampling_drops_some_messages() {
        let topics = TopicManager::from_config(&BrokerConfig::default());
        let session = Arc::new(ClientSession::new(
            1,
            "127.0.0.1:4000".parse().unwrap(),
            CancellationToken::new(),
        ));
        let channel = topics.subscribe("t", "c", session.clone()).unwrap();
        session.subscribe(channel).unwrap();
        session.set_ready(10_000);

        let results: Vec<Admission> = (0..1000).map(|_| admit(&session, 10)).collect();
        let delivered = results.iter().filter(|a| **a == Admission::Deliver).count();
        assert!(delivered > 20 && delivered < 250, "delivered {}", delivered);
        assert!(results.iter().all(|a| *a != Admission::Hold));
    }
}
