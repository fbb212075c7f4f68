// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Dispatcher is the message router of the broker.
//!
//! It owns the subscription trie, the session store and the broker stats;
//! every mutation of that shared state happens on this task, so no locks
//! are involved anywhere in the broker.

use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, MissedTickBehavior};

use crate::auth::Authenticator;
use crate::commands::SessionToDispatcherCmd;
use crate::config::Config;
use crate::store::SessionStore;

mod session_cmd;
mod sys_tree;
mod trie;

use sys_tree::Stats;
use trie::SubTrie;

#[derive(Debug, Clone, Copy)]
struct DispatcherConfig {
    max_qos: codec::QoS,
    outbound_highwater_bytes: usize,
    sys_interval: Duration,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    auth: Box<dyn Authenticator>,

    store: SessionStore,
    sub_trie: SubTrie,
    stats: Stats,

    session_receiver: Receiver<SessionToDispatcherCmd>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: &Config,
        auth: Box<dyn Authenticator>,
        session_receiver: Receiver<SessionToDispatcherCmd>,
    ) -> Self {
        Self {
            config: DispatcherConfig {
                max_qos: config.max_qos(),
                outbound_highwater_bytes: config.outbound_highwater_bytes(),
                sys_interval: Duration::from_secs(u64::from(
                    config.stats_publish_interval_secs(),
                )),
            },
            auth,
            store: SessionStore::new(),
            sub_trie: SubTrie::new(),
            stats: Stats::new(),
            session_receiver,
        }
    }

    pub async fn run_loop(&mut self) {
        let tick = if self.config.sys_interval.is_zero() {
            // $SYS publication disabled, keep a timer for delivery retries.
            Duration::from_secs(30)
        } else {
            self.config.sys_interval
        };
        let mut sys_timer = interval(tick);
        sys_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of an interval completes immediately.
        sys_timer.tick().await;

        loop {
            tokio::select! {
                Some(cmd) = self.session_receiver.recv() => {
                    self.handle_session_cmd(cmd).await;
                }
                _ = sys_timer.tick() => {
                    self.handle_sys_tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{
        ConnectFlags, ConnectPacket, ConnectReturnCode, PacketId, PublishPacket, QoS,
        SubscribeAck, SubscribePacket,
    };
    use tokio::sync::mpsc::{self, Receiver, Sender};

    use crate::auth::AnonymousAuth;
    use crate::commands::DispatcherToSessionCmd;
    use crate::store::InflightState;
    use crate::types::{CloseReason, SessionId};

    fn new_dispatcher() -> Dispatcher {
        let config = Config::default();
        let (_sender, receiver) = mpsc::channel(16);
        Dispatcher::new(&config, Box::new(AnonymousAuth::new(true)), receiver)
    }

    fn connect_packet(client_id: &str, clean_session: bool) -> ConnectPacket {
        let mut packet = ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(clean_session);
        packet.set_connect_flags(flags);
        packet
    }

    async fn connect(
        dispatcher: &mut Dispatcher,
        session_id: SessionId,
        packet: ConnectPacket,
    ) -> (Sender<DispatcherToSessionCmd>, Receiver<DispatcherToSessionCmd>) {
        let (sender, receiver) = mpsc::channel(64);
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Connect(
                session_id,
                packet,
                sender.clone(),
            ))
            .await;
        (sender, receiver)
    }

    fn expect_connect_ack(receiver: &mut Receiver<DispatcherToSessionCmd>) -> (bool, ConnectReturnCode) {
        match receiver.try_recv().unwrap() {
            DispatcherToSessionCmd::ConnectAck(ack) => (ack.session_present(), ack.return_code()),
            cmd => panic!("Expected ConnectAck, got {cmd:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_ack() {
        let mut dispatcher = new_dispatcher();
        let (_tx, mut rx) = connect(&mut dispatcher, 1, connect_packet("a", true)).await;
        let (present, code) = expect_connect_ack(&mut rx);
        assert!(!present);
        assert_eq!(code, ConnectReturnCode::Accepted);
    }

    #[tokio::test]
    async fn test_session_present_on_reconnect() {
        let mut dispatcher = new_dispatcher();
        let (_tx, mut rx) = connect(&mut dispatcher, 1, connect_packet("a", false)).await;
        expect_connect_ack(&mut rx);
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Disconnect(1, CloseReason::PeerClosed))
            .await;

        let (_tx, mut rx) = connect(&mut dispatcher, 2, connect_packet("a", false)).await;
        let (present, code) = expect_connect_ack(&mut rx);
        assert!(present);
        assert_eq!(code, ConnectReturnCode::Accepted);
    }

    #[tokio::test]
    async fn test_takeover_closes_elder_connection() {
        let mut dispatcher = new_dispatcher();
        let (_tx1, mut rx1) = connect(&mut dispatcher, 1, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx1);

        let (_tx2, mut rx2) = connect(&mut dispatcher, 2, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx2);

        match rx1.try_recv().unwrap() {
            DispatcherToSessionCmd::Disconnect(CloseReason::TakeOver) => (),
            cmd => panic!("Expected take-over disconnect, got {cmd:?}"),
        }
    }

    #[tokio::test]
    async fn test_qos0_routing() {
        let mut dispatcher = new_dispatcher();
        let (_tx_a, mut rx_a) = connect(&mut dispatcher, 1, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx_a);
        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 2, connect_packet("b", true)).await;
        expect_connect_ack(&mut rx_b);

        let subscribe = SubscribePacket::new("a/+/c", QoS::AtMostOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(2, subscribe))
            .await;
        match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::SubscribeAck(ack) => {
                assert_eq!(ack.packet_id(), PacketId::new(1));
                assert_eq!(ack.acknowledgements(), &[SubscribeAck::QoS(QoS::AtMostOnce)]);
            }
            cmd => panic!("Expected SubscribeAck, got {cmd:?}"),
        }

        let publish = PublishPacket::new("a/x/c", QoS::AtMostOnce, b"hi").unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(1, publish))
            .await;
        match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::Publish(packet) => {
                assert_eq!(packet.topic(), "a/x/c");
                assert_eq!(packet.message(), b"hi");
                assert_eq!(packet.qos(), QoS::AtMostOnce);
            }
            cmd => panic!("Expected Publish, got {cmd:?}"),
        }
        // Publisher gets no acknowledgement for QoS 0.
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_qos1_flow_and_min_qos() {
        let mut dispatcher = new_dispatcher();
        let (_tx_a, mut rx_a) = connect(&mut dispatcher, 1, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx_a);
        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 2, connect_packet("b", true)).await;
        expect_connect_ack(&mut rx_b);

        let subscribe = SubscribePacket::new("t/q1", QoS::AtLeastOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(2, subscribe))
            .await;
        rx_b.try_recv().unwrap();

        let mut publish = PublishPacket::new("t/q1", QoS::AtLeastOnce, b"m").unwrap();
        publish.set_packet_id(PacketId::new(42));
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(1, publish))
            .await;

        // Subscriber receives the message with a broker-chosen packet id.
        let forwarded_id = match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::Publish(packet) => {
                assert_eq!(packet.qos(), QoS::AtLeastOnce);
                packet.packet_id()
            }
            cmd => panic!("Expected Publish, got {cmd:?}"),
        };
        // Publisher gets PublishAck with its own packet id.
        match rx_a.try_recv().unwrap() {
            DispatcherToSessionCmd::PublishAck(packet_id) => {
                assert_eq!(packet_id, PacketId::new(42));
            }
            cmd => panic!("Expected PublishAck, got {cmd:?}"),
        }

        // Subscriber acks; the in-flight window entry is removed.
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::PublishAck(2, forwarded_id))
            .await;
        let session = dispatcher.store.get("b").unwrap();
        assert!(session.outbound_inflight.is_empty());

        // A publish with QoS 2 to the same QoS 1 subscription is delivered
        // with the effective QoS min(2, 1) = 1.
        let mut publish = PublishPacket::new("t/q1", QoS::ExactOnce, b"m2").unwrap();
        publish.set_packet_id(PacketId::new(43));
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(1, publish))
            .await;
        match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::Publish(packet) => {
                assert_eq!(packet.qos(), QoS::AtLeastOnce);
            }
            cmd => panic!("Expected Publish, got {cmd:?}"),
        }
    }

    #[tokio::test]
    async fn test_qos2_inbound_deduplicates() {
        let mut dispatcher = new_dispatcher();
        let (_tx_a, mut rx_a) = connect(&mut dispatcher, 1, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx_a);
        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 2, connect_packet("b", true)).await;
        expect_connect_ack(&mut rx_b);

        let subscribe = SubscribePacket::new("t/q2", QoS::ExactOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(2, subscribe))
            .await;
        rx_b.try_recv().unwrap();

        let mut publish = PublishPacket::new("t/q2", QoS::ExactOnce, b"m").unwrap();
        publish.set_packet_id(PacketId::new(7));
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(1, publish.clone()))
            .await;
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            DispatcherToSessionCmd::Publish(_)
        ));
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            DispatcherToSessionCmd::PublishReceived(id) if id == PacketId::new(7)
        ));

        // Redelivery before PublishRelease is not routed again.
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(1, publish))
            .await;
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            DispatcherToSessionCmd::PublishReceived(_)
        ));
        assert!(rx_b.try_recv().is_err());

        // PublishRelease clears the inbound window and is answered with
        // PublishComplete.
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::PublishRelease(1, PacketId::new(7)))
            .await;
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            DispatcherToSessionCmd::PublishComplete(id) if id == PacketId::new(7)
        ));
        assert!(dispatcher.store.get("a").unwrap().inbound_inflight.is_empty());
    }

    #[tokio::test]
    async fn test_qos2_outbound_dialogue() {
        let mut dispatcher = new_dispatcher();
        let (_tx_a, mut rx_a) = connect(&mut dispatcher, 1, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx_a);
        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 2, connect_packet("b", true)).await;
        expect_connect_ack(&mut rx_b);

        let subscribe = SubscribePacket::new("t/q2", QoS::ExactOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(2, subscribe))
            .await;
        rx_b.try_recv().unwrap();

        let mut publish = PublishPacket::new("t/q2", QoS::ExactOnce, b"m").unwrap();
        publish.set_packet_id(PacketId::new(7));
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(1, publish))
            .await;
        let forwarded_id = match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::Publish(packet) => packet.packet_id(),
            cmd => panic!("Expected Publish, got {cmd:?}"),
        };

        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::PublishReceived(2, forwarded_id))
            .await;
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            DispatcherToSessionCmd::PublishRelease(id) if id == forwarded_id
        ));
        assert_eq!(
            dispatcher.store.get("b").unwrap().outbound_inflight[&forwarded_id.value()].state,
            InflightState::AwaitingPubcomp
        );

        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::PublishComplete(2, forwarded_id))
            .await;
        assert!(dispatcher.store.get("b").unwrap().outbound_inflight.is_empty());
    }

    #[tokio::test]
    async fn test_retained_delivered_after_suback() {
        let mut dispatcher = new_dispatcher();
        let (_tx_a, mut rx_a) = connect(&mut dispatcher, 1, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx_a);

        let mut publish = PublishPacket::new("sensor/temp", QoS::AtMostOnce, b"23").unwrap();
        publish.set_retain(true);
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(1, publish))
            .await;

        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 2, connect_packet("b", true)).await;
        expect_connect_ack(&mut rx_b);
        let subscribe = SubscribePacket::new("sensor/#", QoS::AtMostOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(2, subscribe))
            .await;

        assert!(matches!(
            rx_b.try_recv().unwrap(),
            DispatcherToSessionCmd::SubscribeAck(_)
        ));
        match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::Publish(packet) => {
                assert_eq!(packet.topic(), "sensor/temp");
                assert_eq!(packet.message(), b"23");
                assert!(packet.retain());
            }
            cmd => panic!("Expected retained Publish, got {cmd:?}"),
        }
    }

    #[tokio::test]
    async fn test_will_fired_on_ungraceful_close() {
        let mut dispatcher = new_dispatcher();
        let mut packet = connect_packet("w", true);
        packet.set_will_topic("down/w").unwrap();
        packet.set_will_message(b"bye").unwrap();
        let (_tx_w, mut rx_w) = connect(&mut dispatcher, 1, packet).await;
        expect_connect_ack(&mut rx_w);

        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 2, connect_packet("b", true)).await;
        expect_connect_ack(&mut rx_b);
        let subscribe = SubscribePacket::new("down/+", QoS::AtMostOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(2, subscribe))
            .await;
        rx_b.try_recv().unwrap();

        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Disconnect(
                1,
                CloseReason::KeepaliveTimeout,
            ))
            .await;
        match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::Publish(packet) => {
                assert_eq!(packet.topic(), "down/w");
                assert_eq!(packet.message(), b"bye");
            }
            cmd => panic!("Expected will Publish, got {cmd:?}"),
        }
    }

    #[tokio::test]
    async fn test_will_suppressed_on_graceful_close() {
        let mut dispatcher = new_dispatcher();
        let mut packet = connect_packet("w", true);
        packet.set_will_topic("down/w").unwrap();
        packet.set_will_message(b"bye").unwrap();
        let (_tx_w, mut rx_w) = connect(&mut dispatcher, 1, packet).await;
        expect_connect_ack(&mut rx_w);

        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 2, connect_packet("b", true)).await;
        expect_connect_ack(&mut rx_b);
        let subscribe = SubscribePacket::new("down/+", QoS::AtMostOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(2, subscribe))
            .await;
        rx_b.try_recv().unwrap();

        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Disconnect(1, CloseReason::Graceful))
            .await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_queue_drained_on_resume() {
        let mut dispatcher = new_dispatcher();
        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 1, connect_packet("b", false)).await;
        expect_connect_ack(&mut rx_b);
        let subscribe = SubscribePacket::new("t/x", QoS::AtLeastOnce, PacketId::new(1)).unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Subscribe(1, subscribe))
            .await;
        rx_b.try_recv().unwrap();
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Disconnect(1, CloseReason::PeerClosed))
            .await;

        let (_tx_a, mut rx_a) = connect(&mut dispatcher, 2, connect_packet("a", true)).await;
        expect_connect_ack(&mut rx_a);
        let mut publish = PublishPacket::new("t/x", QoS::AtLeastOnce, b"later").unwrap();
        publish.set_packet_id(PacketId::new(9));
        dispatcher
            .handle_session_cmd(SessionToDispatcherCmd::Publish(2, publish))
            .await;
        assert_eq!(dispatcher.store.get("b").unwrap().queued.len(), 1);

        let (_tx_b, mut rx_b) = connect(&mut dispatcher, 3, connect_packet("b", false)).await;
        let (present, _code) = expect_connect_ack(&mut rx_b);
        assert!(present);
        match rx_b.try_recv().unwrap() {
            DispatcherToSessionCmd::Publish(packet) => {
                assert_eq!(packet.message(), b"later");
                assert_eq!(packet.qos(), QoS::AtLeastOnce);
            }
            cmd => panic!("Expected queued Publish, got {cmd:?}"),
        }
    }
}
