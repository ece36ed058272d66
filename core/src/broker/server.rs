use super::connection::ProtocolV2;
use super::handler::MessageHandler;
use super::registry::ConnectionRegistry;
use super::session::ClientSession;
use crate::metrics::BrokerMetrics;
use crate::protocol::{ErrorCode, Frame, ProtocolError, ProtocolVersion};
use crate::tls::NodeTlsAcceptor;
use crate::topic_manager::TopicManager;
use crate::{config::BrokerConfig, Result, RillmqError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by the accept loop and every connection task
struct Shared {
    config: Arc<BrokerConfig>,
    handler: Arc<MessageHandler>,
    v2: ProtocolV2,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    next_client_id: AtomicU64,
}

pub struct BrokerServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl BrokerServer {
    /// Validate the configuration, load TLS material and bind the listener
    pub async fn bind(
        config: BrokerConfig,
        topics: Arc<TopicManager>,
        metrics: Arc<BrokerMetrics>,
    ) -> Result<Self> {
        config.validate().map_err(RillmqError::Config)?;

        let tls = match config.tls_config() {
            Some(tls_config) => Some(NodeTlsAcceptor::new(tls_config)?),
            None => None,
        };

        let listener = TcpListener::bind(&config.tcp_address).await?;
        info!(
            "RillMQ node {} listening on {} (tls {})",
            config.node_id,
            listener.local_addr()?,
            if tls.is_some() { "available" } else { "off" }
        );

        let config = Arc::new(config);
        let handler = Arc::new(MessageHandler::new(config.clone(), topics, metrics));
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                v2: ProtocolV2::new(handler.clone(), tls),
                handler,
                registry: Arc::new(ConnectionRegistry::new()),
                shutdown: CancellationToken::new(),
                next_client_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        self.shared.handler.topics()
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        self.shared.handler.metrics()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Accept connections until [`BrokerServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => {
                    info!("Stopped accepting connections");
                    break;
                }
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = Self::optimize_client_socket(&stream) {
                                warn!("Failed to tune client socket {}: {}", peer_addr, e);
                            }
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(Self::handle_connection(shared, stream, peer_addr));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn optimize_client_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        let socket_ref = SockRef::from(stream);
        socket_ref.set_nodelay(true)?;
        socket_ref.set_keepalive(true)?;
        Ok(())
    }

    async fn handle_connection(shared: Arc<Shared>, mut stream: TcpStream, peer_addr: SocketAddr) {
        let metrics = shared.handler.metrics().clone();

        let mut magic = [0u8; 4];
        let handshake_timeout = shared.config.handshake_timeout();
        match tokio::time::timeout(handshake_timeout, stream.read_exact(&mut magic)).await {
            Err(_) => {
                warn!(
                    "Client {} sent no protocol magic within {:?}",
                    peer_addr, handshake_timeout
                );
                return;
            }
            Ok(Err(e)) => {
                debug!("Client {} left before the handshake: {}", peer_addr, e);
                return;
            }
            Ok(Ok(_)) => {}
        }

        let Some(version) = ProtocolVersion::from_magic(&magic) else {
            warn!("Client {} sent bad protocol magic {:?}", peer_addr, magic);
            metrics.record_protocol_error();
            let err = ProtocolError::fatal(ErrorCode::BadProtocol, "client sent bad protocol magic");
            if let Err(e) = stream.write_all(&Frame::error(err.to_payload()).to_bytes()).await {
                debug!("Failed to report bad magic to {}: {}", peer_addr, e);
            }
            return;
        };

        let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(ClientSession::new(
            id,
            peer_addr,
            shared.shutdown.child_token(),
        ));
        shared.registry.register(session.clone());
        metrics.connection_opened();
        info!(
            "Client {} connected as #{} using {:?} (active: {})",
            peer_addr,
            id,
            version,
            metrics.active_connections()
        );

        let served = match version {
            ProtocolVersion::V2 => shared.v2.serve(Box::new(stream), session.clone()).await,
        };
        if let Err(e) = served {
            error!("Error handling client {}: {}", peer_addr, e);
        }

        let requeued = session.release(shared.handler.topics());
        if requeued > 0 {
            metrics.record_requeued(requeued as u64);
        }
        shared.registry.deregister(id);
        metrics.connection_closed();
        info!("Client {} disconnected", peer_addr);
    }

    /// Stop accepting and close every session
    pub fn shutdown(&self) -> usize {
        info!("Initiating graceful shutdown...");
        self.shared.shutdown.cancel();
        self.shared.registry.close_all()
    }

    /// Wait until every connection task has finished, up to `timeout`.
    /// Returns whether the registry drained.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let registry = &self.shared.registry;
        let drained = tokio::time::timeout(timeout, async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "{} sessions still open after {:?}",
                registry.len(),
                timeout
            );
        }
        drained
    }
}
