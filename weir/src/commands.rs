// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::{
    ConnectAckPacket, ConnectPacket, PacketId, PublishPacket, SubscribeAckPacket, SubscribePacket,
    UnsubscribeAckPacket, UnsubscribePacket,
};
use tokio::sync::mpsc::Sender;

use crate::types::{CloseReason, SessionId};

/// Commands sent from a connection task to the dispatcher.
///
/// Packet-named variants report that the corresponding control packet arrived
/// on the wire.
#[derive(Debug)]
pub enum SessionToDispatcherCmd {
    /// Connect packet received; carries this connection's command channel so
    /// the dispatcher can attach it to the session.
    Connect(SessionId, ConnectPacket, Sender<DispatcherToSessionCmd>),

    Publish(SessionId, PublishPacket),

    /// Client acknowledged a QoS 1 publish the broker sent.
    PublishAck(SessionId, PacketId),

    /// Client confirmed receipt of a QoS 2 publish the broker sent.
    PublishReceived(SessionId, PacketId),

    /// Client released an inbound QoS 2 publish.
    PublishRelease(SessionId, PacketId),

    /// Client completed the QoS 2 handshake for a publish the broker sent.
    PublishComplete(SessionId, PacketId),

    Subscribe(SessionId, SubscribePacket),

    Unsubscribe(SessionId, UnsubscribePacket),

    /// Bytes of one packet written to the socket.
    PacketSent(SessionId, usize),

    /// Bytes of one packet read from the socket.
    PacketReceived(SessionId, usize),

    /// Connection is gone, with the reason that decides will handling.
    Disconnect(SessionId, CloseReason),
}

/// Commands sent from the dispatcher to a connection task.
///
/// Packet-named variants instruct the connection to put that control packet
/// on the wire.
#[derive(Debug, Clone)]
pub enum DispatcherToSessionCmd {
    ConnectAck(ConnectAckPacket),

    Publish(PublishPacket),

    PublishAck(PacketId),

    PublishReceived(PacketId),

    PublishRelease(PacketId),

    PublishComplete(PacketId),

    SubscribeAck(SubscribeAckPacket),

    UnsubscribeAck(UnsubscribeAckPacket),

    /// Close this connection, e.g. when its session is taken over.
    Disconnect(CloseReason),
}
