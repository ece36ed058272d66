//! Command execution against a session and the topic store.
//!
//! Every command either succeeds with an optional response frame or fails
//! with a [`ProtocolError`]; whether the connection survives the failure is
//! decided by the error's fatal flag.

use super::session::{ClientSession, SessionState};
use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;
use crate::protocol::{
    frame, Command, ErrorCode, Frame, IdentifyRequest, MessageId, ProtocolError,
};
use crate::storage::StoreError;
use crate::topic_manager::{is_valid_name, TopicManager};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn invalid_state(command: &str) -> ProtocolError {
    ProtocolError::fatal(
        ErrorCode::Invalid,
        format!("cannot {} in current state", command),
    )
}

fn out_of_range(command: &str, what: &str, value: i64, max: u64) -> ProtocolError {
    ProtocolError::fatal(
        ErrorCode::Invalid,
        format!("{} {} {} out of range 0-{}", command, what, value, max),
    )
}

pub struct MessageHandler {
    config: Arc<BrokerConfig>,
    topics: Arc<TopicManager>,
    metrics: Arc<BrokerMetrics>,
}

impl MessageHandler {
    pub fn new(config: Arc<BrokerConfig>, topics: Arc<TopicManager>, metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            config,
            topics,
            metrics,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    /// Settle IDENTIFY for a session still awaiting it.
    ///
    /// Returns the response frame: the negotiated settings as JSON when the
    /// client asked for feature negotiation, `OK` otherwise.
    pub fn identify(
        &self,
        session: &ClientSession,
        body: &[u8],
        tls_available: bool,
    ) -> Result<Frame, ProtocolError> {
        if session.state() != SessionState::AwaitingIdentity {
            return Err(invalid_state("IDENTIFY"));
        }
        let request = IdentifyRequest::parse(body)?;
        if request.deflate || request.snappy {
            debug!(
                "Client {} asked for compression, declining",
                session.remote_addr()
            );
        }
        let identity = request.negotiate(&self.config, tls_available)?;

        info!(
            "Client {} identified as '{}' ({}), heartbeat {:?}, tls {}",
            session.remote_addr(),
            identity.client_id,
            identity.user_agent,
            identity.heartbeat_interval,
            identity.tls
        );

        let response = if identity.feature_negotiation {
            let json = serde_json::to_vec(&identity.response(&self.config)).map_err(|e| {
                ProtocolError::fatal(ErrorCode::Invalid, format!("IDENTIFY response - {}", e))
            })?;
            Frame::response(json)
        } else {
            Frame::ok()
        };

        if !session.identify(identity) {
            return Err(invalid_state("IDENTIFY"));
        }
        Ok(response)
    }

    /// Execute one command received after IDENTIFY
    pub fn handle_command(
        &self,
        session: &Arc<ClientSession>,
        command: Command,
    ) -> Result<Option<Frame>, ProtocolError> {
        if session.state() == SessionState::Closing {
            match command {
                Command::Fin(_) | Command::Req { .. } | Command::Touch(_) | Command::Nop => {}
                Command::Rdy(_) => return Ok(None),
                other => return Err(invalid_state(other.name())),
            }
        }

        match command {
            Command::Identify(_) => Err(invalid_state("IDENTIFY")),
            Command::Sub { topic, channel } => self.subscribe(session, &topic, &channel),
            Command::Pub { topic, body } => self.publish(&topic, body),
            Command::Mpub { topic, bodies } => self.publish_batch(&topic, bodies),
            Command::Dpub {
                topic,
                defer_ms,
                body,
            } => self.publish_deferred(&topic, defer_ms, body),
            Command::Rdy(count) => self.ready(session, count),
            Command::Fin(id) => self.finish(session, id),
            Command::Req { id, timeout_ms } => self.requeue(session, id, timeout_ms),
            Command::Touch(id) => self.touch(session, id),
            Command::Nop => Ok(None),
            Command::Cls => self.close(session),
            Command::Rejected(err) => Err(err),
        }
    }

    fn check_topic(command: &str, topic: &str) -> Result<(), ProtocolError> {
        if !is_valid_name(topic) {
            return Err(ProtocolError::client(
                ErrorCode::BadTopic,
                format!("{} topic name '{}' is not valid", command, topic),
            ));
        }
        Ok(())
    }

    fn check_body(&self, command: &str, index: usize, body: &Bytes) -> Result<(), ProtocolError> {
        if body.is_empty() {
            return Err(ProtocolError::client(
                ErrorCode::BadMessage,
                format!("{} invalid message({}) body size 0", command, index),
            ));
        }
        if body.len() > self.config.max_msg_size {
            return Err(ProtocolError::client(
                ErrorCode::BadMessage,
                format!(
                    "{} message too big {} > {}",
                    command,
                    body.len(),
                    self.config.max_msg_size
                ),
            ));
        }
        Ok(())
    }

    fn subscribe(
        &self,
        session: &Arc<ClientSession>,
        topic: &str,
        channel: &str,
    ) -> Result<Option<Frame>, ProtocolError> {
        if session.state() != SessionState::Ready || session.credit_granted() {
            return Err(invalid_state("SUB"));
        }
        Self::check_topic("SUB", topic)?;
        if !is_valid_name(channel) {
            return Err(ProtocolError::client(
                ErrorCode::BadChannel,
                format!("SUB channel name '{}' is not valid", channel),
            ));
        }

        let bound = self
            .topics
            .subscribe(topic, channel, session.clone())
            .map_err(|e| {
                ProtocolError::client(ErrorCode::BadChannel, format!("SUB failed - {}", e))
            })?;
        if session.subscribe(bound.clone()).is_err() {
            self.topics.release_channel(&bound, session.id());
            return Err(invalid_state("SUB"));
        }

        info!(
            "Client {} subscribed to {}/{}",
            session.remote_addr(),
            topic,
            channel
        );
        Ok(Some(Frame::ok()))
    }

    fn publish(&self, topic: &str, body: Bytes) -> Result<Option<Frame>, ProtocolError> {
        Self::check_topic("PUB", topic)?;
        self.check_body("PUB", 0, &body)?;
        self.topics.publish(topic, body).map_err(|e| {
            ProtocolError::client(ErrorCode::PubFailed, format!("PUB failed - {}", e))
        })?;
        self.metrics.record_published(1);
        Ok(Some(Frame::ok()))
    }

    fn publish_batch(&self, topic: &str, bodies: Vec<Bytes>) -> Result<Option<Frame>, ProtocolError> {
        Self::check_topic("MPUB", topic)?;
        for (index, body) in bodies.iter().enumerate() {
            self.check_body("MPUB", index, body)?;
        }
        let count = self.topics.publish_batch(topic, bodies).map_err(|e| {
            ProtocolError::client(ErrorCode::MpubFailed, format!("MPUB failed - {}", e))
        })?;
        self.metrics.record_published(count as u64);
        Ok(Some(Frame::ok()))
    }

    fn publish_deferred(
        &self,
        topic: &str,
        defer_ms: i64,
        body: Bytes,
    ) -> Result<Option<Frame>, ProtocolError> {
        Self::check_topic("DPUB", topic)?;
        if defer_ms < 0 || defer_ms as u64 > self.config.max_req_timeout_ms {
            return Err(out_of_range("DPUB", "timeout", defer_ms, self.config.max_req_timeout_ms));
        }
        self.check_body("DPUB", 0, &body)?;

        let delay = Duration::from_millis(defer_ms as u64);
        self.topics
            .publish_deferred(topic, body, delay)
            .map_err(|e| {
                ProtocolError::client(ErrorCode::DpubFailed, format!("DPUB failed - {}", e))
            })?;
        self.metrics.record_published(1);
        if !delay.is_zero() {
            self.metrics.record_deferred();
        }
        Ok(Some(Frame::ok()))
    }

    fn ready(&self, session: &ClientSession, count: i64) -> Result<Option<Frame>, ProtocolError> {
        if count < 0 || count > self.config.max_rdy_count {
            return Err(out_of_range(
                "RDY",
                "count",
                count,
                self.config.max_rdy_count as u64,
            ));
        }
        session.set_ready(count);
        Ok(None)
    }

    fn finish(&self, session: &ClientSession, id: MessageId) -> Result<Option<Frame>, ProtocolError> {
        let failed = |reason: String| {
            ProtocolError::client(ErrorCode::FinFailed, format!("FIN {} failed {}", id, reason))
        };
        let channel = session
            .channel()
            .ok_or_else(|| failed("- not subscribed".to_string()))?;
        channel
            .finish(&id, session.id())
            .map_err(|e| failed(format!("- {}", e)))?;
        session.remove_in_flight(&id);
        self.metrics.record_finished();
        Ok(None)
    }

    fn requeue(
        &self,
        session: &ClientSession,
        id: MessageId,
        timeout_ms: i64,
    ) -> Result<Option<Frame>, ProtocolError> {
        if timeout_ms < 0 || timeout_ms as u64 > self.config.max_req_timeout_ms {
            return Err(out_of_range("REQ", "timeout", timeout_ms, self.config.max_req_timeout_ms));
        }
        let failed = |reason: String| {
            ProtocolError::client(ErrorCode::ReqFailed, format!("REQ {} failed {}", id, reason))
        };
        let channel = session
            .channel()
            .ok_or_else(|| failed("- not subscribed".to_string()))?;
        channel
            .requeue(&id, session.id(), Duration::from_millis(timeout_ms as u64))
            .map_err(|e| failed(format!("- {}", e)))?;
        session.remove_in_flight(&id);
        self.metrics.record_requeued(1);
        if timeout_ms > 0 {
            self.metrics.record_deferred();
        }
        Ok(None)
    }

    fn touch(&self, session: &ClientSession, id: MessageId) -> Result<Option<Frame>, ProtocolError> {
        let failed = |reason: String| {
            ProtocolError::client(
                ErrorCode::TouchFailed,
                format!("TOUCH {} failed {}", id, reason),
            )
        };
        let channel = session
            .channel()
            .ok_or_else(|| failed("- not subscribed".to_string()))?;
        let timeout = session.msg_timeout(self.config.msg_timeout());
        channel
            .touch(&id, session.id(), timeout)
            .map_err(|e: StoreError| failed(format!("- {}", e)))?;
        Ok(None)
    }

    fn close(&self, session: &ClientSession) -> Result<Option<Frame>, ProtocolError> {
        match session.state() {
            SessionState::Ready | SessionState::Subscribed => {
                session.start_close();
                debug!("Client {} sent CLS", session.remote_addr());
                Ok(Some(Frame::response(Bytes::from_static(frame::CLOSE_WAIT))))
            }
            _ => {
                warn!("Client {} sent CLS in state {:?}", session.remote_addr(), session.state());
                Err(invalid_state("CLS"))
            }
        }
    }
}
