// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handlers for packets received from the client.

use codec::{utils, ConnectPacket, Packet, PingResponsePacket};
use std::time::Duration;

use super::{Session, Status};
use crate::commands::SessionToDispatcherCmd;
use crate::types::CloseReason;

impl Session {
    pub(super) async fn handle_client_packet(&mut self, packet: Packet) {
        match self.status {
            Status::Invalid => match packet {
                Packet::Connect(packet) => self.on_client_connect(packet).await,
                packet => {
                    // The first packet from a client MUST be a Connect
                    // packet [MQTT-3.1.0-1].
                    log::error!(
                        "session: Got {:?} before Connect, id {}",
                        packet.packet_type(),
                        self.id
                    );
                    self.close(CloseReason::ProtocolError).await;
                }
            },
            // Clients may pipeline packets without waiting for ConnectAck;
            // command channel order guarantees the dispatcher sees the
            // Connect first.
            Status::Connecting | Status::Connected => self.on_connected_packet(packet).await,
            Status::Disconnecting | Status::Disconnected => (),
        }
    }

    async fn on_connected_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connect(_packet) => {
                // A client may only send the Connect packet once
                // [MQTT-3.1.0-2].
                log::error!("session: Got a second Connect packet, id {}", self.id);
                self.close(CloseReason::ProtocolError).await;
            }
            Packet::Publish(packet) => {
                self.forward(SessionToDispatcherCmd::Publish(self.id, packet))
                    .await;
            }
            Packet::PublishAck(packet) => {
                self.forward(SessionToDispatcherCmd::PublishAck(
                    self.id,
                    packet.packet_id(),
                ))
                .await;
            }
            Packet::PublishReceived(packet) => {
                self.forward(SessionToDispatcherCmd::PublishReceived(
                    self.id,
                    packet.packet_id(),
                ))
                .await;
            }
            Packet::PublishRelease(packet) => {
                self.forward(SessionToDispatcherCmd::PublishRelease(
                    self.id,
                    packet.packet_id(),
                ))
                .await;
            }
            Packet::PublishComplete(packet) => {
                self.forward(SessionToDispatcherCmd::PublishComplete(
                    self.id,
                    packet.packet_id(),
                ))
                .await;
            }
            Packet::Subscribe(packet) => {
                self.forward(SessionToDispatcherCmd::Subscribe(self.id, packet))
                    .await;
            }
            Packet::Unsubscribe(packet) => {
                self.forward(SessionToDispatcherCmd::Unsubscribe(self.id, packet))
                    .await;
            }
            Packet::PingRequest(_packet) => self.on_client_ping().await,
            Packet::Disconnect(_packet) => {
                // The will is discarded without publication on a clean
                // disconnect [MQTT-3.14.4-3].
                self.close(CloseReason::Graceful).await;
            }
            Packet::ConnectAck(_)
            | Packet::SubscribeAck(_)
            | Packet::UnsubscribeAck(_)
            | Packet::PingResponse(_) => {
                log::error!(
                    "session: Got server-to-client packet {:?}, id {}",
                    packet.packet_type(),
                    self.id
                );
                self.close(CloseReason::ProtocolError).await;
            }
        }
    }

    async fn on_client_connect(&mut self, mut packet: ConnectPacket) {
        // A zero-byte client id gets a broker-assigned one [MQTT-3.1.3-6];
        // the codec has already required clean session for it.
        if packet.client_id().is_empty() {
            let random_id = format!("weir-{}", utils::random_string(12));
            if packet.set_client_id(&random_id).is_err() {
                self.close(CloseReason::ProtocolError).await;
                return;
            }
        }
        self.client_id = packet.client_id().to_string();

        self.keepalive_wait = if packet.keep_alive() > 0 {
            Some(Duration::from_secs_f64(
                f64::from(packet.keep_alive()) * self.config.keepalive_grace_multiplier(),
            ))
        } else {
            None
        };

        self.status = Status::Connecting;
        self.forward(SessionToDispatcherCmd::Connect(
            self.id,
            packet,
            self.cmd_sender.clone(),
        ))
        .await;
    }

    async fn on_client_ping(&mut self) {
        if let Err(err) = self.send(PingResponsePacket::new()).await {
            log::error!("session: Failed to send ping response, id {}, {err}", self.id);
            self.close(CloseReason::IoError).await;
        }
    }

    async fn forward(&mut self, cmd: SessionToDispatcherCmd) {
        if let Err(err) = self.dispatcher_sender.send(cmd).await {
            log::error!("session: Dispatcher is gone, id {}, {err}", self.id);
            self.close(CloseReason::IoError).await;
        }
    }
}
