// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handlers for commands arriving from the dispatcher.

use codec::{
    ConnectReturnCode, PublishAckPacket, PublishCompletePacket, PublishReceivedPacket,
    PublishReleasePacket,
};

use super::{Session, Status};
use crate::commands::DispatcherToSessionCmd;
use crate::types::CloseReason;

impl Session {
    pub(super) async fn handle_dispatcher_cmd(&mut self, cmd: DispatcherToSessionCmd) {
        let ret = match cmd {
            DispatcherToSessionCmd::ConnectAck(packet) => {
                let accepted = packet.return_code() == ConnectReturnCode::Accepted;
                if accepted {
                    self.status = Status::Connected;
                }
                let ret = self.send(packet).await;
                if !accepted {
                    self.close(CloseReason::AuthFailed).await;
                }
                ret
            }
            DispatcherToSessionCmd::Publish(packet) => self.send(packet).await,
            DispatcherToSessionCmd::PublishAck(packet_id) => {
                self.send(PublishAckPacket::new(packet_id)).await
            }
            DispatcherToSessionCmd::PublishReceived(packet_id) => {
                self.send(PublishReceivedPacket::new(packet_id)).await
            }
            DispatcherToSessionCmd::PublishRelease(packet_id) => {
                self.send(PublishReleasePacket::new(packet_id)).await
            }
            DispatcherToSessionCmd::PublishComplete(packet_id) => {
                self.send(PublishCompletePacket::new(packet_id)).await
            }
            DispatcherToSessionCmd::SubscribeAck(packet) => self.send(packet).await,
            DispatcherToSessionCmd::UnsubscribeAck(packet) => self.send(packet).await,
            DispatcherToSessionCmd::Disconnect(reason) => {
                self.close(reason).await;
                Ok(())
            }
        };

        if let Err(err) = ret {
            log::error!(
                "session: Failed to send packet to client, id {}, {err}",
                self.id
            );
            self.close(CloseReason::IoError).await;
        }
    }
}
