// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;
use tokio::time::sleep;

use codec::{Packet, PacketId, PublishPacket, QoS, UnsubscribePacket};

mod common;
use common::{start_broker, Client};

#[tokio::test]
async fn test_qos0_roundtrip() {
    start_broker(18841).await;

    let mut subscriber = Client::handshake(18841, "B", true).await;
    subscriber.subscribe("a/+/c", QoS::AtMostOnce, 1).await;

    let mut publisher = Client::handshake(18841, "A", true).await;
    let packet = PublishPacket::new("a/x/c", QoS::AtMostOnce, b"hi").unwrap();
    publisher.send(&packet).await;

    match subscriber.recv_packet().await {
        Packet::Publish(packet) => {
            assert_eq!(packet.topic(), "a/x/c");
            assert_eq!(packet.message(), b"hi");
            assert_eq!(packet.qos(), QoS::AtMostOnce);
            assert!(!packet.retain());
        }
        packet => panic!("Expected Publish, got {packet:?}"),
    }
}

#[tokio::test]
async fn test_no_delivery_without_match() {
    start_broker(18842).await;

    let mut subscriber = Client::handshake(18842, "B", true).await;
    subscriber.subscribe("a/+/c", QoS::AtMostOnce, 1).await;

    let mut publisher = Client::handshake(18842, "A", true).await;
    // One level too deep for the single-level wildcard.
    let packet = PublishPacket::new("a/x/y/c", QoS::AtMostOnce, b"hi").unwrap();
    publisher.send(&packet).await;

    assert!(subscriber
        .try_recv_packet(Duration::from_secs(1))
        .await
        .is_none());
}

#[tokio::test]
async fn test_retained_message() {
    start_broker(18843).await;

    let mut publisher = Client::handshake(18843, "P", true).await;
    let mut packet = PublishPacket::new("sensor/temp", QoS::AtMostOnce, b"23").unwrap();
    packet.set_retain(true);
    publisher.send(&packet).await;
    sleep(Duration::from_millis(200)).await;

    // A new subscriber receives the retained message right after the
    // SubscribeAck, marked with the retain flag.
    let mut subscriber = Client::handshake(18843, "S1", true).await;
    subscriber.subscribe("sensor/#", QoS::AtMostOnce, 1).await;
    match subscriber.recv_packet().await {
        Packet::Publish(packet) => {
            assert_eq!(packet.topic(), "sensor/temp");
            assert_eq!(packet.message(), b"23");
            assert!(packet.retain());
        }
        packet => panic!("Expected retained Publish, got {packet:?}"),
    }

    // An empty retained payload clears the slot.
    let mut packet = PublishPacket::new("sensor/temp", QoS::AtMostOnce, b"").unwrap();
    packet.set_retain(true);
    publisher.send(&packet).await;
    sleep(Duration::from_millis(200)).await;

    let mut subscriber = Client::handshake(18843, "S2", true).await;
    subscriber.subscribe("sensor/#", QoS::AtMostOnce, 2).await;
    assert!(subscriber
        .try_recv_packet(Duration::from_secs(1))
        .await
        .is_none());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    start_broker(18844).await;

    let mut subscriber = Client::handshake(18844, "B", true).await;
    subscriber.subscribe("news/today", QoS::AtMostOnce, 1).await;

    let unsubscribe = UnsubscribePacket::new("news/today", PacketId::new(2)).unwrap();
    subscriber.send(&unsubscribe).await;
    match subscriber.recv_packet().await {
        Packet::UnsubscribeAck(ack) => assert_eq!(ack.packet_id(), PacketId::new(2)),
        packet => panic!("Expected UnsubscribeAck, got {packet:?}"),
    }

    let mut publisher = Client::handshake(18844, "A", true).await;
    let packet = PublishPacket::new("news/today", QoS::AtMostOnce, b"x").unwrap();
    publisher.send(&packet).await;

    assert!(subscriber
        .try_recv_packet(Duration::from_secs(1))
        .await
        .is_none());
}

#[tokio::test]
async fn test_sys_stats_published() {
    start_broker(18845).await;

    // The test broker publishes $SYS stats every second as retained
    // messages with decimal payloads.
    let mut subscriber = Client::handshake(18845, "sys-watcher", true).await;
    subscriber
        .subscribe("$SYS/broker/uptime", QoS::AtMostOnce, 1)
        .await;

    match subscriber.try_recv_packet(Duration::from_secs(5)).await {
        Some(Packet::Publish(packet)) => {
            assert_eq!(packet.topic(), "$SYS/broker/uptime");
            let payload = std::str::from_utf8(packet.message()).unwrap();
            let _uptime: u64 = payload.parse().unwrap();
        }
        packet => panic!("Expected $SYS Publish, got {packet:?}"),
    }
}
