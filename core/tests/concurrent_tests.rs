mod common;

use bytes::Bytes;
use common::{test_config, TestClient, TestNode};
use rillmq::{Frame, FrameType, Message};
use std::collections::HashSet;
use std::time::Duration;
use tokio::task::JoinSet;

#[tokio::test]
async fn test_concurrent_producers() {
    let node = TestNode::start(test_config()).await;
    let num_producers = 8;
    let messages_per_producer = 50;

    let mut tasks = JoinSet::new();
    for producer_id in 0..num_producers {
        let addr = node.addr;
        tasks.spawn(async move {
            let mut client = TestClient::connect(addr).await;
            client.identify_quiet().await;
            for msg_id in 0..messages_per_producer {
                let body = format!("producer_{}_message_{}", producer_id, msg_id);
                assert_eq!(client.publish("concurrent", body.as_bytes()).await, Frame::ok());
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    let topic = node.topics.get_topic("concurrent").unwrap();
    assert_eq!(topic.message_count(), (num_producers * messages_per_producer) as u64);
    assert_eq!(
        node.metrics.snapshot().messages_published,
        (num_producers * messages_per_producer) as u64
    );

    node.stop().await;
}

#[tokio::test]
async fn test_credit_is_never_exceeded() {
    let node = TestNode::start(test_config()).await;

    let mut client = node.connect().await;
    client
        .identify(r#"{"heartbeat_interval":-1,"msg_timeout":60000}"#)
        .await;
    client.subscribe("t", "c").await;
    for i in 0..20 {
        node.topics.publish("t", Bytes::from(format!("{}", i))).unwrap();
    }

    client.rdy(3).await;
    let mut outstanding = Vec::new();
    for _ in 0..3 {
        outstanding.push(client.next_message().await);
    }
    assert!(client.try_next_frame(Duration::from_millis(150)).await.is_none());

    // Finishing does not restore credit; only RDY does
    for message in outstanding.drain(..) {
        client.fin(&message).await;
    }
    assert!(client.try_next_frame(Duration::from_millis(150)).await.is_none());

    client.rdy(5).await;
    for _ in 0..5 {
        outstanding.push(client.next_message().await);
    }
    assert!(client.try_next_frame(Duration::from_millis(150)).await.is_none());

    let channel = node.topics.get_topic("t").unwrap().get_channel("c").unwrap();
    assert_eq!(channel.in_flight_count(), 5);
    assert_eq!(channel.depth(), 12);

    node.stop().await;
}

#[tokio::test]
async fn test_consumers_share_a_channel_without_duplicates() {
    let node = TestNode::start(test_config()).await;
    let total = 200;

    let mut consumers = JoinSet::new();
    for _ in 0..4 {
        let mut client = node.connect().await;
        client
            .identify(r#"{"heartbeat_interval":-1,"msg_timeout":60000}"#)
            .await;
        client.subscribe("shared", "workers").await;
        client.rdy(25).await;
        consumers.spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = client.try_next_frame(Duration::from_millis(500)).await {
                assert_eq!(frame.frame_type, FrameType::Message);
                let message = Message::decode(frame.payload).unwrap();
                client.fin(&message).await;
                client.rdy(25).await;
                seen.push(message.body);
            }
            seen
        });
    }

    let mut producer = node.connect().await;
    producer.identify_quiet().await;
    for batch in 0..(total / 10) {
        let bodies: Vec<Vec<u8>> = (0..10)
            .map(|i| format!("{}", batch * 10 + i).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = bodies.iter().map(|b| b.as_slice()).collect();
        assert_eq!(producer.mpub("shared", &refs).await, Frame::ok());
    }

    let mut delivered = Vec::new();
    while let Some(result) = consumers.join_next().await {
        delivered.extend(result.unwrap());
    }
    let unique: HashSet<Bytes> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), total);
    assert_eq!(unique.len(), total);
    assert_eq!(node.metrics.snapshot().messages_finished, total as u64);

    node.stop().await;
}

#[tokio::test]
async fn test_registry_does_not_leak_sessions() {
    let node = TestNode::start(test_config()).await;

    let mut tasks = JoinSet::new();
    for i in 0..20 {
        let addr = node.addr;
        tasks.spawn(async move {
            let mut client = TestClient::connect(addr).await;
            client.identify_quiet().await;
            if i % 2 == 0 {
                client.subscribe("t", "c#ephemeral").await;
                client.rdy(1).await;
            }
            if i % 3 == 0 {
                client.command("CLS").await;
                client.next_frame().await;
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    for _ in 0..100 {
        if node.server.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(node.server.registry().is_empty());
    let snapshot = node.metrics.snapshot();
    assert_eq!(snapshot.connections_total, 20);
    assert_eq!(snapshot.active_connections, 0);

    // The last consumer leaving removed the ephemeral channel
    let topic = node.topics.get_topic("t").unwrap();
    assert!(topic.get_channel("c#ephemeral").is_none());

    node.stop().await;
}
