// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;

use codec::{
    Packet, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS,
};

mod common;
use common::{start_broker, Client};

#[tokio::test]
async fn test_qos1_ack_flow() {
    start_broker(18851).await;

    let mut subscriber = Client::handshake(18851, "S", true).await;
    subscriber.subscribe("t/q1", QoS::AtLeastOnce, 1).await;

    let mut publisher = Client::handshake(18851, "P", true).await;
    let mut packet = PublishPacket::new("t/q1", QoS::AtLeastOnce, b"m").unwrap();
    packet.set_packet_id(PacketId::new(42));
    publisher.send(&packet).await;

    // The broker forwards with its own packet id and acks the publisher
    // with the publisher's id.
    let forwarded_id = match subscriber.recv_packet().await {
        Packet::Publish(packet) => {
            assert_eq!(packet.qos(), QoS::AtLeastOnce);
            assert_eq!(packet.message(), b"m");
            assert_ne!(packet.packet_id().value(), 0);
            packet.packet_id()
        }
        packet => panic!("Expected Publish, got {packet:?}"),
    };
    match publisher.recv_packet().await {
        Packet::PublishAck(ack) => assert_eq!(ack.packet_id(), PacketId::new(42)),
        packet => panic!("Expected PublishAck, got {packet:?}"),
    }

    subscriber
        .send(&PublishAckPacket::new(forwarded_id))
        .await;

    // The dialogue is complete; a second message flows the same way.
    let mut packet = PublishPacket::new("t/q1", QoS::AtLeastOnce, b"m2").unwrap();
    packet.set_packet_id(PacketId::new(43));
    publisher.send(&packet).await;
    match subscriber.recv_packet().await {
        Packet::Publish(packet) => assert_eq!(packet.message(), b"m2"),
        packet => panic!("Expected Publish, got {packet:?}"),
    }
    match publisher.recv_packet().await {
        Packet::PublishAck(ack) => assert_eq!(ack.packet_id(), PacketId::new(43)),
        packet => panic!("Expected PublishAck, got {packet:?}"),
    }
}

#[tokio::test]
async fn test_qos2_four_way_handshake() {
    start_broker(18852).await;

    let mut subscriber = Client::handshake(18852, "S", true).await;
    subscriber.subscribe("t/q2", QoS::ExactOnce, 1).await;

    let mut publisher = Client::handshake(18852, "P", true).await;
    let mut packet = PublishPacket::new("t/q2", QoS::ExactOnce, b"m").unwrap();
    packet.set_packet_id(PacketId::new(7));
    publisher.send(&packet).await;

    match publisher.recv_packet().await {
        Packet::PublishReceived(ack) => assert_eq!(ack.packet_id(), PacketId::new(7)),
        packet => panic!("Expected PublishReceived, got {packet:?}"),
    }

    // Subscriber side of the four-way handshake.
    let forwarded_id = match subscriber.recv_packet().await {
        Packet::Publish(packet) => {
            assert_eq!(packet.qos(), QoS::ExactOnce);
            packet.packet_id()
        }
        packet => panic!("Expected Publish, got {packet:?}"),
    };
    subscriber
        .send(&PublishReceivedPacket::new(forwarded_id))
        .await;
    match subscriber.recv_packet().await {
        Packet::PublishRelease(packet) => assert_eq!(packet.packet_id(), forwarded_id),
        packet => panic!("Expected PublishRelease, got {packet:?}"),
    }
    subscriber
        .send(&PublishCompletePacket::new(forwarded_id))
        .await;

    // Redelivery of the same packet id before PublishRelease must not be
    // routed a second time.
    let mut dup = PublishPacket::new("t/q2", QoS::ExactOnce, b"m").unwrap();
    dup.set_packet_id(PacketId::new(7));
    dup.set_dup(true).unwrap();
    publisher.send(&dup).await;
    match publisher.recv_packet().await {
        Packet::PublishReceived(ack) => assert_eq!(ack.packet_id(), PacketId::new(7)),
        packet => panic!("Expected PublishReceived, got {packet:?}"),
    }
    assert!(subscriber
        .try_recv_packet(Duration::from_secs(1))
        .await
        .is_none());

    // Publisher finishes its half.
    publisher
        .send(&PublishReleasePacket::new(PacketId::new(7)))
        .await;
    match publisher.recv_packet().await {
        Packet::PublishComplete(ack) => assert_eq!(ack.packet_id(), PacketId::new(7)),
        packet => panic!("Expected PublishComplete, got {packet:?}"),
    }
}

#[tokio::test]
async fn test_publish_release_for_unknown_id_still_completed() {
    start_broker(18853).await;

    let mut client = Client::handshake(18853, "P", true).await;
    client
        .send(&PublishReleasePacket::new(PacketId::new(99)))
        .await;
    match client.recv_packet().await {
        Packet::PublishComplete(ack) => assert_eq!(ack.packet_id(), PacketId::new(99)),
        packet => panic!("Expected PublishComplete, got {packet:?}"),
    }
}

#[tokio::test]
async fn test_subscription_caps_delivery_qos() {
    start_broker(18854).await;

    let mut subscriber = Client::handshake(18854, "S", true).await;
    subscriber.subscribe("t/mixed", QoS::AtMostOnce, 1).await;

    let mut publisher = Client::handshake(18854, "P", true).await;
    let mut packet = PublishPacket::new("t/mixed", QoS::AtLeastOnce, b"m").unwrap();
    packet.set_packet_id(PacketId::new(5));
    publisher.send(&packet).await;

    // Effective QoS is min(publish 1, granted 0) = 0.
    match subscriber.recv_packet().await {
        Packet::Publish(packet) => {
            assert_eq!(packet.qos(), QoS::AtMostOnce);
            assert_eq!(packet.message(), b"m");
        }
        packet => panic!("Expected Publish, got {packet:?}"),
    }
    match publisher.recv_packet().await {
        Packet::PublishAck(ack) => assert_eq!(ack.packet_id(), PacketId::new(5)),
        packet => panic!("Expected PublishAck, got {packet:?}"),
    }
}
