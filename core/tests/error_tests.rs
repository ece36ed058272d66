mod common;

use bytes::Bytes;
use common::{test_config, TestNode};
use rillmq::{BrokerConfig, Frame, FrameType};
use std::time::Duration;

const CLOSE_WAIT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn test_command_before_identify_is_fatal() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.command("SUB t c").await;
    let error = client.next_error().await;
    assert!(error.starts_with("E_INVALID"), "{}", error);
    assert!(client.is_closed(CLOSE_WAIT).await);
    assert!(node.metrics.snapshot().protocol_errors >= 1);

    node.stop().await;
}

#[tokio::test]
async fn test_second_identify_is_fatal() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;
    client.command_with_body("IDENTIFY", b"{}").await;
    assert!(client.next_error().await.starts_with("E_INVALID"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    node.stop().await;
}

#[tokio::test]
async fn test_bad_identify_body_is_fatal() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.command_with_body("IDENTIFY", b"{not json").await;
    assert!(client.next_error().await.starts_with("E_BAD_BODY"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    let mut client = node.connect().await;
    client.command_with_body("IDENTIFY", br#"{"heartbeat_interval":10}"#).await;
    assert!(client.next_error().await.starts_with("E_BAD_BODY"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    node.stop().await;
}

#[tokio::test]
async fn test_unknown_command_is_fatal() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;
    client.command("JUMP").await;
    assert!(client.next_error().await.starts_with("E_INVALID"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    node.stop().await;
}

#[tokio::test]
async fn test_bad_names_keep_connection_open() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;

    client.command_with_body("PUB bad*topic", b"x").await;
    assert!(client.next_error().await.starts_with("E_BAD_TOPIC"));

    client.command("SUB ok bad*channel").await;
    assert!(client.next_error().await.starts_with("E_BAD_CHANNEL"));

    // Still usable afterwards
    assert_eq!(client.publish("ok", b"x").await, Frame::ok());

    node.stop().await;
}

#[tokio::test]
async fn test_oversized_messages_are_rejected() {
    let config = BrokerConfig {
        max_msg_size: 16,
        ..test_config()
    };
    let node = TestNode::start(config).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;

    let big = vec![b'x'; 17];
    client.command_with_body("PUB t", &big).await;
    assert!(client.next_error().await.starts_with("E_BAD_MESSAGE"));

    client.command_with_body("PUB t", b"").await;
    assert!(client.next_error().await.starts_with("E_BAD_MESSAGE"));

    // One bad member rejects the whole batch
    let frame = client
        .mpub("t", &[&b"fine"[..], &big[..], &b"also fine"[..]])
        .await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert!(frame.payload.starts_with(b"E_BAD_MESSAGE"));
    assert_eq!(node.topics.get_topic("t").map(|t| t.message_count()).unwrap_or(0), 0);

    // The stream stayed in sync
    assert_eq!(client.publish("t", b"small").await, Frame::ok());

    node.stop().await;
}

#[tokio::test]
async fn test_rdy_out_of_range_is_fatal() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;
    client.subscribe("t", "c").await;
    client.rdy(2501).await;
    assert!(client.next_error().await.starts_with("E_INVALID"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    node.stop().await;
}

#[tokio::test]
async fn test_double_subscribe_is_fatal() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;
    client.subscribe("t", "c").await;
    client.command("SUB t d").await;
    assert!(client.next_error().await.starts_with("E_INVALID"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    node.stop().await;
}

#[tokio::test]
async fn test_second_fin_fails_without_closing() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;
    client.subscribe("t", "c").await;
    client.rdy(1).await;
    node.topics.publish("t", Bytes::from_static(b"once")).unwrap();

    let message = client.next_message().await;
    client.fin(&message).await;
    client.fin(&message).await;
    assert!(client.next_error().await.starts_with("E_FIN_FAILED"));

    client.command(&format!("TOUCH {}", message.id)).await;
    assert!(client.next_error().await.starts_with("E_TOUCH_FAILED"));

    assert_eq!(client.publish("t", b"next").await, Frame::ok());
    assert_eq!(node.metrics.snapshot().messages_finished, 1);

    node.stop().await;
}

#[tokio::test]
async fn test_req_without_subscription() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;
    client.command("REQ 0000000000000000 0").await;
    assert!(client.next_error().await.starts_with("E_REQ_FAILED"));

    client.command("REQ 0000000000000000 99999999").await;
    assert!(client.next_error().await.starts_with("E_INVALID"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    node.stop().await;
}

#[tokio::test]
async fn test_publish_after_cls_is_fatal() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client.identify_quiet().await;
    client.subscribe("t", "c").await;
    client.command("CLS").await;
    assert_eq!(
        client.next_frame().await,
        Frame::response(Bytes::from_static(b"CLOSE_WAIT"))
    );
    client.command("NOP").await;
    client.command_with_body("PUB t", b"x").await;
    assert!(client.next_error().await.starts_with("E_INVALID"));
    assert!(client.is_closed(CLOSE_WAIT).await);

    node.stop().await;
}
