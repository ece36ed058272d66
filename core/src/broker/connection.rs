//! Drives one V2 client connection after the magic has been read.
//!
//! The connection starts as a single framed stream while IDENTIFY is
//! settled (and TLS, when negotiated, is layered on). It is then split: the
//! read half feeds the input loop below and the write half is shared with a
//! spawned [`MessagePump`].

use super::handler::MessageHandler;
use super::pump::MessagePump;
use super::session::ClientSession;
use super::writer::{BoxedStream, ConnectionWriter, CLOSE_GRACE};
use crate::protocol::{
    Command, CommandCodec, CommandError, ErrorCode, Frame, FrameCodec, Identity, ProtocolError,
    V2Codec,
};
use crate::tls::NodeTlsAcceptor;
use crate::{Result, RillmqError};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::time::error::Elapsed;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

type CommandReader = FramedRead<ReadHalf<BoxedStream>, CommandCodec>;

async fn read_command(
    reader: &mut CommandReader,
    deadline: Option<Duration>,
) -> std::result::Result<Option<std::result::Result<Command, CommandError>>, Elapsed> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, reader.next()).await,
        None => Ok(reader.next().await),
    }
}

pub struct ProtocolV2 {
    handler: Arc<MessageHandler>,
    tls: Option<NodeTlsAcceptor>,
}

impl ProtocolV2 {
    pub fn new(handler: Arc<MessageHandler>, tls: Option<NodeTlsAcceptor>) -> Self {
        Self { handler, tls }
    }

    pub fn handler(&self) -> &Arc<MessageHandler> {
        &self.handler
    }

    fn codec(&self) -> V2Codec {
        let config = self.handler.config();
        V2Codec::new(
            CommandCodec::new(config.max_msg_size, config.max_body_size),
            FrameCodec::new(config.max_frame_size),
        )
    }

    /// Run the connection until the client leaves, a fatal error is
    /// reported or the session is cancelled.
    pub async fn serve(&self, stream: BoxedStream, session: Arc<ClientSession>) -> Result<()> {
        let mut framed = Framed::new(stream, self.codec());

        let Some(identity) = self.identify(&mut framed, &session).await? else {
            return Ok(());
        };

        let mut parts = framed.into_parts();
        let (commands, frames) = parts.codec.into_parts();
        let (stream, pending) = if identity.tls {
            if !parts.read_buf.is_empty() {
                let err = ProtocolError::fatal(
                    ErrorCode::Invalid,
                    "cannot send commands before the TLS handshake",
                );
                self.handler.metrics().record_protocol_error();
                warn!("Client {} pipelined data before TLS", session.remote_addr());
                parts.io.write_all(&Frame::error(err.to_payload()).to_bytes()).await?;
                parts.io.flush().await?;
                return Ok(());
            }
            match self.upgrade(parts.io, &session).await? {
                Some(stream) => (stream, BytesMut::new()),
                None => return Ok(()),
            }
        } else {
            (parts.io, parts.read_buf)
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, commands);
        reader.read_buffer_mut().extend_from_slice(&pending);
        let writer = ConnectionWriter::new(
            FramedWrite::new(write_half, frames),
            identity.output_buffer_size,
            session.cancel_token().clone(),
        );

        let pump = MessagePump::new(
            session.clone(),
            writer.clone(),
            self.handler.metrics().clone(),
            identity.msg_timeout,
        );
        let pump = tokio::spawn(pump.run(identity.clone()));

        let result = self.input_loop(&mut reader, &writer, &session, &identity).await;

        session.close();
        if let Err(e) = pump.await {
            error!("Pump for {} panicked: {}", session.remote_addr(), e);
        }
        if let Err(e) = writer.close(CLOSE_GRACE).await {
            debug!("Closing {} failed: {}", session.remote_addr(), e);
        }
        result
    }

    /// Wait for IDENTIFY and answer it. `None` means the connection is
    /// already finished (client left, timed out or failed the handshake).
    async fn identify(
        &self,
        framed: &mut Framed<BoxedStream, V2Codec>,
        session: &ClientSession,
    ) -> Result<Option<Identity>> {
        let timeout = self.handler.config().client_timeout();
        let next = tokio::select! {
            _ = session.cancel_token().cancelled() => return Ok(None),
            next = tokio::time::timeout(timeout, framed.next()) => next,
        };

        let command = match next {
            Err(_) => {
                warn!(
                    "Client {} sent nothing within {:?}",
                    session.remote_addr(),
                    timeout
                );
                return Ok(None);
            }
            Ok(None) => return Ok(None),
            Ok(Some(Err(CommandError::Io(e)))) => return Err(e.into()),
            Ok(Some(Err(CommandError::Protocol(err)))) => {
                self.reject(framed, session, err).await?;
                return Ok(None);
            }
            Ok(Some(Ok(command))) => command,
        };

        let response = match command {
            Command::Identify(body) => {
                self.handler
                    .identify(session, &body, self.tls.is_some())
            }
            other => Err(ProtocolError::fatal(
                ErrorCode::Invalid,
                format!("first command must be IDENTIFY, got {}", other.name()),
            )),
        };
        match response {
            Ok(frame) => {
                framed.send(frame).await?;
                Ok(session.identity().cloned())
            }
            Err(err) => {
                self.reject(framed, session, err).await?;
                Ok(None)
            }
        }
    }

    async fn reject(
        &self,
        framed: &mut Framed<BoxedStream, V2Codec>,
        session: &ClientSession,
        err: ProtocolError,
    ) -> Result<()> {
        self.handler.metrics().record_protocol_error();
        warn!("Client {} failed handshake: {}", session.remote_addr(), err);
        framed.send(Frame::error(err.to_payload())).await?;
        Ok(())
    }

    /// Run the server handshake and confirm it with `OK` over TLS. The whole
    /// exchange is bounded by `client_timeout`; `None` means the session was
    /// cancelled first.
    async fn upgrade(
        &self,
        stream: BoxedStream,
        session: &ClientSession,
    ) -> Result<Option<BoxedStream>> {
        let acceptor = self
            .tls
            .as_ref()
            .ok_or_else(|| RillmqError::Network("TLS negotiated without a certificate".to_string()))?;
        let timeout = self.handler.config().client_timeout();

        let handshake = async {
            let mut stream = acceptor.accept(stream).await?;
            stream.write_all(&Frame::ok().to_bytes()).await?;
            stream.flush().await?;
            Ok::<_, RillmqError>(stream)
        };
        let stream = tokio::select! {
            _ = session.cancel_token().cancelled() => return Ok(None),
            result = tokio::time::timeout(timeout, handshake) => match result {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(RillmqError::Network(format!(
                        "TLS handshake not finished within {:?}",
                        timeout
                    )));
                }
            },
        };
        debug!("Client {} upgraded to TLS", session.remote_addr());
        Ok(Some(Box::new(stream)))
    }

    async fn input_loop(
        &self,
        reader: &mut CommandReader,
        writer: &ConnectionWriter,
        session: &Arc<ClientSession>,
        identity: &Identity,
    ) -> Result<()> {
        let cancel = session.cancel_token().clone();
        let deadline = identity.heartbeat_interval.map(|interval| interval * 2);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = read_command(reader, deadline) => next,
            };

            let command = match next {
                Ok(Some(Ok(command))) => command,
                Ok(None) => {
                    debug!("Client {} closed the connection", session.remote_addr());
                    return Ok(());
                }
                Ok(Some(Err(CommandError::Io(e)))) => return Err(e.into()),
                Ok(Some(Err(CommandError::Protocol(err)))) => {
                    self.report(writer, session, &err).await?;
                    return Ok(());
                }
                Err(_) => {
                    return Err(RillmqError::Network(format!(
                        "no data from client within {:?}",
                        deadline.unwrap_or_default()
                    )));
                }
            };

            session.touch_activity();
            trace!("{} from {}", command.name(), session.remote_addr());

            match self.handler.handle_command(session, command) {
                Ok(Some(frame)) => writer.send(frame).await?,
                Ok(None) => {}
                Err(err) => {
                    self.report(writer, session, &err).await?;
                    if err.is_fatal() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn report(
        &self,
        writer: &ConnectionWriter,
        session: &ClientSession,
        err: &ProtocolError,
    ) -> Result<()> {
        self.handler.metrics().record_protocol_error();
        if err.is_fatal() {
            warn!("Closing {} after protocol error: {}", session.remote_addr(), err);
        } else {
            debug!("Client {} error: {}", session.remote_addr(), err);
        }
        writer.send(Frame::error(err.to_payload())).await?;
        Ok(())
    }
}
