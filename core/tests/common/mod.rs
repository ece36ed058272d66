#![allow(dead_code)]

use bytes::{BufMut, BytesMut};
use futures::StreamExt;
use rillmq::protocol::MAGIC_V2;
use rillmq::{
    BrokerConfig, BrokerMetrics, BrokerServer, Frame, FrameCodec, FrameType, Message,
    QueueScanner, TopicManager,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

pub const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Small timeouts so redelivery paths run in test time
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        tcp_address: "127.0.0.1:0".to_string(),
        msg_timeout_ms: 200,
        queue_scan_interval_ms: 20,
        queue_scan_refresh_interval_ms: 50,
        ..Default::default()
    }
}

pub struct TestNode {
    pub server: Arc<BrokerServer>,
    pub addr: SocketAddr,
    pub topics: Arc<TopicManager>,
    pub metrics: Arc<BrokerMetrics>,
    background: CancellationToken,
    server_task: JoinHandle<()>,
    scanner: JoinHandle<()>,
}

impl TestNode {
    pub async fn start(config: BrokerConfig) -> Self {
        let topics = Arc::new(TopicManager::from_config(&config));
        let metrics = Arc::new(BrokerMetrics::new());
        let background = CancellationToken::new();
        let scanner =
            QueueScanner::new(topics.clone(), metrics.clone(), &config).spawn(background.clone());

        let server = Arc::new(
            BrokerServer::bind(config, topics.clone(), metrics.clone())
                .await
                .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                server.run().await.unwrap();
            })
        };

        Self {
            server,
            addr,
            topics,
            metrics,
            background,
            server_task,
            scanner,
        }
    }

    pub async fn connect(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    pub async fn stop(self) {
        self.server.shutdown();
        self.server_task.await.unwrap();
        assert!(self.server.wait_for_drain(Duration::from_secs(5)).await);
        self.topics.close();
        self.background.cancel();
        self.scanner.await.unwrap();
    }
}

pub struct TestClient {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect and send the protocol magic
    pub async fn connect(addr: SocketAddr) -> Self {
        let mut client = Self::connect_raw(addr).await;
        client.write(&MAGIC_V2).await;
        client
    }

    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: FramedRead::new(read, FrameCodec::default()),
            writer,
        }
    }

    /// Give back the socket, e.g. to layer TLS on it. Only valid while no
    /// frame is half-read.
    pub fn into_stream(self) -> TcpStream {
        self.reader.into_inner().reunite(self.writer).unwrap()
    }

    pub async fn write(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
    }

    pub async fn command(&mut self, line: &str) {
        self.write(format!("{}\n", line).as_bytes()).await;
    }

    pub async fn command_with_body(&mut self, line: &str, body: &[u8]) {
        let mut buf = BytesMut::new();
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        self.write(&buf).await;
    }

    pub async fn identify(&mut self, json: &str) -> Frame {
        self.command_with_body("IDENTIFY", json.as_bytes()).await;
        self.next_frame().await
    }

    /// IDENTIFY with heartbeats off, expecting `OK`
    pub async fn identify_quiet(&mut self) {
        let frame = self.identify(r#"{"heartbeat_interval":-1}"#).await;
        assert_eq!(frame, Frame::ok());
    }

    pub async fn subscribe(&mut self, topic: &str, channel: &str) {
        self.command(&format!("SUB {} {}", topic, channel)).await;
        assert_eq!(self.next_frame().await, Frame::ok());
    }

    pub async fn publish(&mut self, topic: &str, body: &[u8]) -> Frame {
        self.command_with_body(&format!("PUB {}", topic), body).await;
        self.next_frame().await
    }

    pub async fn mpub(&mut self, topic: &str, bodies: &[&[u8]]) -> Frame {
        let mut body = BytesMut::new();
        body.put_u32(bodies.len() as u32);
        for member in bodies {
            body.put_u32(member.len() as u32);
            body.put_slice(member);
        }
        self.command_with_body(&format!("MPUB {}", topic), &body).await;
        self.next_frame().await
    }

    pub async fn rdy(&mut self, count: i64) {
        self.command(&format!("RDY {}", count)).await;
    }

    pub async fn fin(&mut self, message: &Message) {
        self.command(&format!("FIN {}", message.id)).await;
    }

    /// Next frame from the node; panics on timeout
    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(READ_TIMEOUT, self.reader.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap()
    }

    /// Next frame within `wait`, `None` when nothing arrived
    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<Frame> {
        match tokio::time::timeout(wait, self.reader.next()).await {
            Ok(Some(Ok(frame))) => Some(frame),
            _ => None,
        }
    }

    pub async fn next_message(&mut self) -> Message {
        loop {
            let frame = self.next_frame().await;
            match frame.frame_type {
                FrameType::Message => return Message::decode(frame.payload).unwrap(),
                _ if frame.is_heartbeat() => continue,
                _ => panic!("expected a message, got {:?}", frame),
            }
        }
    }

    /// Next error frame's text
    pub async fn next_error(&mut self) -> String {
        let frame = self.next_frame().await;
        assert_eq!(frame.frame_type, FrameType::Error, "got {:?}", frame);
        String::from_utf8(frame.payload.to_vec()).unwrap()
    }

    /// Whether the node has closed the connection within `wait`
    pub async fn is_closed(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.reader.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}
