// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handlers for commands arriving from connection tasks.

use codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PacketId, PublishPacket, QoS,
    SubscribeAck, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;

use super::Dispatcher;
use crate::auth::{AuthResult, Authenticator};
use crate::commands::{DispatcherToSessionCmd, SessionToDispatcherCmd};
use crate::store::{InflightMessage, InflightState, Will};
use crate::types::{CloseReason, SessionId};

impl Dispatcher {
    pub(super) async fn handle_session_cmd(&mut self, cmd: SessionToDispatcherCmd) {
        match cmd {
            SessionToDispatcherCmd::Connect(session_id, packet, sender) => {
                self.on_session_connect(session_id, packet, sender).await;
            }
            SessionToDispatcherCmd::Publish(session_id, packet) => {
                self.on_session_publish(session_id, packet).await;
            }
            SessionToDispatcherCmd::PublishAck(session_id, packet_id) => {
                self.on_session_publish_ack(session_id, packet_id);
            }
            SessionToDispatcherCmd::PublishReceived(session_id, packet_id) => {
                self.on_session_publish_received(session_id, packet_id).await;
            }
            SessionToDispatcherCmd::PublishRelease(session_id, packet_id) => {
                self.on_session_publish_release(session_id, packet_id).await;
            }
            SessionToDispatcherCmd::PublishComplete(session_id, packet_id) => {
                self.on_session_publish_complete(session_id, packet_id);
            }
            SessionToDispatcherCmd::Subscribe(session_id, packet) => {
                self.on_session_subscribe(session_id, packet).await;
            }
            SessionToDispatcherCmd::Unsubscribe(session_id, packet) => {
                self.on_session_unsubscribe(session_id, packet).await;
            }
            SessionToDispatcherCmd::PacketSent(session_id, bytes) => {
                self.on_packet_sent(session_id, bytes).await;
            }
            SessionToDispatcherCmd::PacketReceived(_session_id, bytes) => {
                self.stats.messages_recv += 1;
                self.stats.bytes_recv += bytes as u64;
            }
            SessionToDispatcherCmd::Disconnect(session_id, reason) => {
                self.on_session_disconnect(session_id, reason).await;
            }
        }
    }

    async fn on_session_connect(
        &mut self,
        session_id: SessionId,
        packet: ConnectPacket,
        sender: Sender<DispatcherToSessionCmd>,
    ) {
        self.stats.nconnections += 1;

        let auth_result =
            self.auth
                .authenticate(packet.client_id(), packet.username(), packet.password());
        if auth_result != AuthResult::Accept {
            log::info!(
                "dispatcher: Rejected connect of client {}, {:?}",
                packet.client_id(),
                auth_result
            );
            let ack = ConnectAckPacket::new(false, auth_result.return_code());
            let _ = sender.send(DispatcherToSessionCmd::ConnectAck(ack)).await;
            let _ = sender
                .send(DispatcherToSessionCmd::Disconnect(CloseReason::AuthFailed))
                .await;
            return;
        }

        let client_id = packet.client_id().to_string();
        let clean_session = packet.connect_flags().clean_session();

        // If a session with this client id is connected, the elder connection
        // is closed in favor of the new one.
        let elder = self
            .store
            .get(&client_id)
            .and_then(|session| session.session_id().zip(session.sender().cloned()));
        if let Some((elder_id, elder_sender)) = elder {
            log::info!("dispatcher: Taking over session of client {client_id}");
            let _ = elder_sender
                .send(DispatcherToSessionCmd::Disconnect(CloseReason::TakeOver))
                .await;
            if let Some(detached) = self.store.detach(elder_id, CloseReason::TakeOver) {
                for filter in &detached.removed_filters {
                    self.sub_trie.unsubscribe(&client_id, filter);
                }
            }
        }

        // A connect with clean session discards prior state.
        if clean_session {
            if let Some(old_session) = self.store.remove(&client_id) {
                for filter in old_session.subscriptions.keys() {
                    self.sub_trie.unsubscribe(&client_id, filter);
                }
            }
        }

        let will = packet.will_topic().map(|topic| Will {
            topic: topic.to_string(),
            message: packet.will_message().to_vec(),
            qos: packet.will_qos(),
            retain: packet.connect_flags().will_retain(),
        });

        let present = self.store.attach(
            &client_id,
            clean_session,
            packet.keep_alive(),
            will,
            session_id,
            sender.clone(),
        );
        log::info!("dispatcher: Client {client_id} connected, session present: {present}");

        let ack = ConnectAckPacket::new(present, ConnectReturnCode::Accepted);
        if sender
            .send(DispatcherToSessionCmd::ConnectAck(ack))
            .await
            .is_err()
        {
            log::warn!("dispatcher: Connection of {client_id} is gone before ConnectAck");
            return;
        }

        if present {
            self.resume_session(&client_id).await;
        }
    }

    /// Redeliver the in-flight window and drain the offline queue of a
    /// persistent session that reconnected.
    async fn resume_session(&mut self, client_id: &str) {
        let Some(session) = self.store.get_mut(client_id) else {
            return;
        };
        let Some(sender) = session.sender().cloned() else {
            return;
        };

        let mut cmds = Vec::new();
        for (packet_id, inflight) in &mut session.outbound_inflight {
            match inflight.state {
                InflightState::AwaitingPuback | InflightState::AwaitingPubrec => {
                    let mut packet = inflight.packet.clone();
                    if packet.set_dup(true).is_ok() {
                        cmds.push(DispatcherToSessionCmd::Publish(packet));
                    }
                }
                InflightState::AwaitingPubcomp => {
                    cmds.push(DispatcherToSessionCmd::PublishRelease(PacketId::new(
                        *packet_id,
                    )));
                }
            }
        }
        let queued: Vec<PublishPacket> = session.queued.drain(..).collect();

        for cmd in cmds {
            let _ = sender.send(cmd).await;
        }
        for packet in queued {
            self.deliver_publish(client_id, packet).await;
        }
    }

    async fn on_session_publish(&mut self, session_id: SessionId, packet: PublishPacket) {
        let Some(client_id) = self.store.client_id_of(session_id) else {
            log::debug!("dispatcher: Publish from unknown session {session_id}");
            return;
        };

        // A retained publish replaces the message stored at its exact topic,
        // an empty payload clears it; the packet is routed either way.
        if packet.retain() {
            self.sub_trie.retain(&packet);
        }

        match packet.qos() {
            QoS::AtMostOnce => {
                self.route_publish(&packet).await;
            }
            QoS::AtLeastOnce => {
                self.route_publish(&packet).await;
                self.reply(
                    session_id,
                    DispatcherToSessionCmd::PublishAck(packet.packet_id()),
                )
                .await;
            }
            QoS::ExactOnce => {
                // Route only the first arrival of this packet id; the id
                // stays in the inbound window until PublishRelease.
                let first_arrival = self
                    .store
                    .get_mut(&client_id)
                    .is_some_and(|session| session.inbound_inflight.insert(packet.packet_id().value()));
                if first_arrival {
                    self.route_publish(&packet).await;
                }
                self.reply(
                    session_id,
                    DispatcherToSessionCmd::PublishReceived(packet.packet_id()),
                )
                .await;
            }
        }
    }

    /// Fan a publish out to every matching subscriber with the effective
    /// QoS `min(publish, granted)`, exactly once per subscriber.
    pub(super) async fn route_publish(&mut self, packet: &PublishPacket) {
        for (client_id, granted) in self.sub_trie.matches(packet.topic()) {
            let qos = packet.qos().min(granted);
            let Ok(out) = PublishPacket::new(packet.topic(), qos, packet.message()) else {
                continue;
            };
            self.deliver_publish(&client_id, out).await;
        }
    }

    /// Hand one publish to a session, honoring its connection state and the
    /// outbound high-water mark.
    pub(super) async fn deliver_publish(&mut self, client_id: &str, mut packet: PublishPacket) {
        let highwater = self.config.outbound_highwater_bytes;
        let Some(session) = self.store.get_mut(client_id) else {
            return;
        };

        if !session.is_connected() {
            if session.clean_session() {
                self.stats.messages_dropped += 1;
            } else if packet.qos() == QoS::AtMostOnce {
                // QoS 0 messages are not queued for offline sessions.
                self.stats.messages_dropped += 1;
            } else {
                session.queued.push_back(packet);
            }
            return;
        }

        let size = packet
            .bytes()
            .unwrap_or_else(|_| packet.topic().len() + packet.message().len() + 4);

        if packet.qos() == QoS::AtMostOnce {
            if session.pending_out_bytes + size > highwater {
                self.stats.messages_dropped += 1;
                return;
            }
            let Some(sender) = session.sender().cloned() else {
                return;
            };
            match sender.try_send(DispatcherToSessionCmd::Publish(packet)) {
                Ok(()) => session.pending_out_bytes += size,
                Err(_err) => self.stats.messages_dropped += 1,
            }
            return;
        }

        let packet_id = match session.allocate_packet_id() {
            Ok(packet_id) => packet_id,
            Err(err) => {
                log::error!("dispatcher: {err}");
                return;
            }
        };
        packet.set_packet_id(packet_id);
        let state = if packet.qos() == QoS::AtLeastOnce {
            InflightState::AwaitingPuback
        } else {
            InflightState::AwaitingPubrec
        };
        session.outbound_inflight.insert(
            packet_id.value(),
            InflightMessage {
                packet: packet.clone(),
                state,
                queued_at: Instant::now(),
            },
        );

        if session.pending_out_bytes + size > highwater {
            // Stays in the in-flight window, sent when the backlog drains.
            session.blocked.push_back(packet_id.value());
            return;
        }
        let Some(sender) = session.sender().cloned() else {
            return;
        };
        match sender.try_send(DispatcherToSessionCmd::Publish(packet)) {
            Ok(()) => session.pending_out_bytes += size,
            Err(TrySendError::Full(_cmd)) => session.blocked.push_back(packet_id.value()),
            Err(TrySendError::Closed(_cmd)) => {}
        }
    }

    /// Send queued-but-paused publishes of one session while its backlog
    /// stays below the high-water mark.
    pub(super) async fn flush_blocked(&mut self, client_id: &str) {
        let highwater = self.config.outbound_highwater_bytes;
        loop {
            let Some(session) = self.store.get_mut(client_id) else {
                return;
            };
            let Some(sender) = session.sender().cloned() else {
                return;
            };
            let Some(&packet_id) = session.blocked.front() else {
                return;
            };
            let Some(inflight) = session.outbound_inflight.get(&packet_id) else {
                session.blocked.pop_front();
                continue;
            };

            let packet = inflight.packet.clone();
            let size = packet
                .bytes()
                .unwrap_or_else(|_| packet.topic().len() + packet.message().len() + 4);
            if session.pending_out_bytes + size > highwater {
                return;
            }
            match sender.try_send(DispatcherToSessionCmd::Publish(packet)) {
                Ok(()) => {
                    session.pending_out_bytes += size;
                    session.blocked.pop_front();
                }
                Err(_err) => return,
            }
        }
    }

    fn on_session_publish_ack(&mut self, session_id: SessionId, packet_id: PacketId) {
        let Some(session) = self.store.by_session_mut(session_id) else {
            return;
        };
        let id = packet_id.value();
        match session.outbound_inflight.get(&id) {
            Some(inflight) if inflight.state == InflightState::AwaitingPuback => {
                session.outbound_inflight.remove(&id);
            }
            _ => log::warn!("dispatcher: Unexpected PublishAck {id} from session {session_id}"),
        }
    }

    async fn on_session_publish_received(&mut self, session_id: SessionId, packet_id: PacketId) {
        if let Some(session) = self.store.by_session_mut(session_id) {
            if let Some(inflight) = session.outbound_inflight.get_mut(&packet_id.value()) {
                if inflight.state == InflightState::AwaitingPubrec {
                    inflight.state = InflightState::AwaitingPubcomp;
                }
            }
        }
        // Reply with PublishRelease even for an unknown id so the peer can
        // finish its half of the handshake.
        self.reply(session_id, DispatcherToSessionCmd::PublishRelease(packet_id))
            .await;
    }

    fn on_session_publish_complete(&mut self, session_id: SessionId, packet_id: PacketId) {
        let Some(session) = self.store.by_session_mut(session_id) else {
            return;
        };
        let id = packet_id.value();
        match session.outbound_inflight.get(&id) {
            Some(inflight) if inflight.state == InflightState::AwaitingPubcomp => {
                session.outbound_inflight.remove(&id);
            }
            _ => {
                log::warn!("dispatcher: Unexpected PublishComplete {id} from session {session_id}");
            }
        }
    }

    async fn on_session_publish_release(&mut self, session_id: SessionId, packet_id: PacketId) {
        if let Some(session) = self.store.by_session_mut(session_id) {
            session.inbound_inflight.remove(&packet_id.value());
        }
        // PublishRelease for an unknown id still elicits PublishComplete.
        self.reply(
            session_id,
            DispatcherToSessionCmd::PublishComplete(packet_id),
        )
        .await;
    }

    async fn on_session_subscribe(&mut self, session_id: SessionId, packet: SubscribePacket) {
        let Some(client_id) = self.store.client_id_of(session_id) else {
            log::debug!("dispatcher: Subscribe from unknown session {session_id}");
            return;
        };

        let mut ack_vec = Vec::with_capacity(packet.topics().len());
        let mut granted_filters = Vec::with_capacity(packet.topics().len());
        for topic in packet.topics() {
            let granted = topic.qos().min(self.config.max_qos);
            self.sub_trie.subscribe(&client_id, topic.topic(), granted);
            granted_filters.push((topic.topic().to_string(), granted));
            ack_vec.push(SubscribeAck::QoS(granted));
        }
        if let Some(session) = self.store.get_mut(&client_id) {
            for (filter, granted) in &granted_filters {
                session.subscriptions.insert(filter.clone(), *granted);
            }
        }

        let ack = SubscribeAckPacket::with_vec(packet.packet_id(), ack_vec);
        self.reply(session_id, DispatcherToSessionCmd::SubscribeAck(ack))
            .await;

        // Retained messages are delivered after the SubscribeAck, once per
        // matched filter, at min(retained QoS, granted QoS).
        for (filter, granted) in granted_filters {
            for retained in self.sub_trie.retained_matches(&filter) {
                let qos = retained.qos().min(granted);
                let Ok(mut out) = PublishPacket::new(retained.topic(), qos, retained.message())
                else {
                    continue;
                };
                out.set_retain(true);
                self.deliver_publish(&client_id, out).await;
            }
        }
    }

    async fn on_session_unsubscribe(&mut self, session_id: SessionId, packet: UnsubscribePacket) {
        let Some(client_id) = self.store.client_id_of(session_id) else {
            return;
        };

        for topic in packet.topics() {
            self.sub_trie.unsubscribe(&client_id, topic.as_ref());
            if let Some(session) = self.store.get_mut(&client_id) {
                session.subscriptions.remove(topic.as_ref());
            }
        }

        let ack = UnsubscribeAckPacket::new(packet.packet_id());
        self.reply(session_id, DispatcherToSessionCmd::UnsubscribeAck(ack))
            .await;
    }

    async fn on_packet_sent(&mut self, session_id: SessionId, bytes: usize) {
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        let highwater = self.config.outbound_highwater_bytes;
        let Some(session) = self.store.by_session_mut(session_id) else {
            return;
        };
        session.pending_out_bytes = session.pending_out_bytes.saturating_sub(bytes);
        if !session.blocked.is_empty() && session.pending_out_bytes < highwater {
            let client_id = session.client_id().to_string();
            self.flush_blocked(&client_id).await;
        }
    }

    async fn on_session_disconnect(&mut self, session_id: SessionId, reason: CloseReason) {
        let Some(detached) = self.store.detach(session_id, reason) else {
            log::debug!("dispatcher: Disconnect of unknown session {session_id}");
            return;
        };
        log::info!(
            "dispatcher: Client {} disconnected, {reason:?}",
            detached.client_id
        );

        for filter in &detached.removed_filters {
            self.sub_trie.unsubscribe(&detached.client_id, filter);
        }

        if let Some(will) = detached.will {
            let Ok(mut packet) = PublishPacket::new(&will.topic, will.qos, &will.message) else {
                log::error!(
                    "dispatcher: Invalid will topic of client {}",
                    detached.client_id
                );
                return;
            };
            if will.retain {
                packet.set_retain(true);
                self.sub_trie.retain(&packet);
            }
            self.route_publish(&packet).await;
        }
    }

    async fn reply(&mut self, session_id: SessionId, cmd: DispatcherToSessionCmd) {
        let Some(sender) = self
            .store
            .by_session_mut(session_id)
            .and_then(|session| session.sender().cloned())
        else {
            return;
        };
        if let Err(err) = sender.send(cmd).await {
            log::warn!("dispatcher: Failed to send cmd to session {session_id}, {err}");
        }
    }
}
