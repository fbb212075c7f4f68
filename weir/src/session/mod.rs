// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-connection protocol state machine.
//!
//! Each accepted socket runs one `Session` task. The task frames and decodes
//! inbound packets, tracks the keep alive deadline, and exchanges commands
//! with the dispatcher, which owns all shared session state.

use codec::{
    ByteArray, ConnectAckPacket, ConnectReturnCode, DecodeError, DecodePacket, EncodePacket,
    FixedHeader, Packet,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::sleep;

use crate::commands::{DispatcherToSessionCmd, SessionToDispatcherCmd};
use crate::error::Error;
use crate::stream::Stream;
use crate::types::{CloseReason, SessionId};

mod client;
mod dispatcher;

/// Upper bound for timer waits standing in for "no deadline".
const FOREVER: Duration = Duration::from_secs(365 * 24 * 3600);

/// Per-connection limits copied out of the broker config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    max_packet_size: usize,
    connect_timeout_secs: u64,
    keepalive_grace_multiplier: f64,
}

impl SessionConfig {
    #[must_use]
    pub const fn new(
        max_packet_size: usize,
        connect_timeout_secs: u64,
        keepalive_grace_multiplier: f64,
    ) -> Self {
        Self {
            max_packet_size,
            connect_timeout_secs,
            keepalive_grace_multiplier,
        }
    }

    #[inline]
    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    #[inline]
    #[must_use]
    pub const fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs
    }

    #[inline]
    #[must_use]
    pub const fn keepalive_grace_multiplier(&self) -> f64 {
        self.keepalive_grace_multiplier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting for the Connect packet.
    Invalid,

    /// Connect forwarded to the dispatcher, waiting for its verdict.
    Connecting,

    Connected,

    Disconnecting,

    Disconnected,
}

enum FrameError {
    /// Remaining length exceeds the configured maximum.
    TooLarge,

    Decode(DecodeError),
}

/// One client connection.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    stream: Stream,

    status: Status,
    client_id: String,
    /// Grace-adjusted keep alive wait, None when disabled.
    keepalive_wait: Option<Duration>,
    last_packet: Instant,
    close_reason: CloseReason,

    dispatcher_sender: Sender<SessionToDispatcherCmd>,
    cmd_sender: Sender<DispatcherToSessionCmd>,
    cmd_receiver: Receiver<DispatcherToSessionCmd>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        stream: Stream,
        dispatcher_sender: Sender<SessionToDispatcherCmd>,
        cmd_sender: Sender<DispatcherToSessionCmd>,
        cmd_receiver: Receiver<DispatcherToSessionCmd>,
    ) -> Self {
        Self {
            id,
            config,
            stream,

            status: Status::Invalid,
            client_id: String::new(),
            keepalive_wait: None,
            last_packet: Instant::now(),
            close_reason: CloseReason::PeerClosed,

            dispatcher_sender,
            cmd_sender,
            cmd_receiver,
        }
    }

    pub async fn run_loop(mut self) {
        let mut buf = Vec::with_capacity(4096);
        let opened_at = Instant::now();

        loop {
            if self.status == Status::Disconnected {
                break;
            }

            let wait = self.next_deadline(opened_at);
            tokio::select! {
                ret = self.stream.read_buf(&mut buf) => match ret {
                    Ok(0) => {
                        log::info!("session: Peer closed connection, id {}", self.id);
                        self.close(CloseReason::PeerClosed).await;
                    }
                    Ok(_n_recv) => self.process_buf(&mut buf).await,
                    Err(err) => {
                        log::error!("session: Socket read failed, id {}, {err}", self.id);
                        self.close(CloseReason::IoError).await;
                    }
                },
                Some(cmd) = self.cmd_receiver.recv() => {
                    self.handle_dispatcher_cmd(cmd).await;
                }
                () = sleep(wait) => {
                    log::warn!(
                        "session: Keep alive expired, client {}, id {}",
                        self.client_id,
                        self.id
                    );
                    self.close(CloseReason::KeepaliveTimeout).await;
                }
            }
        }

        if let Err(err) = self
            .dispatcher_sender
            .send(SessionToDispatcherCmd::Disconnect(self.id, self.close_reason))
            .await
        {
            log::error!(
                "session: Failed to send disconnect cmd, id {}, {err}",
                self.id
            );
        }
    }

    /// How long the timer branch may sleep before a deadline fires.
    ///
    /// Before the Connect packet this is the connect timeout; afterwards the
    /// keep alive deadline, one and a half times (by default) the keep alive
    /// interval past the last received packet [MQTT-3.1.2-24].
    fn next_deadline(&self, opened_at: Instant) -> Duration {
        match self.status {
            Status::Invalid => {
                if self.config.connect_timeout_secs == 0 {
                    FOREVER
                } else {
                    let deadline = opened_at + Duration::from_secs(self.config.connect_timeout_secs);
                    deadline.saturating_duration_since(Instant::now())
                }
            }
            _ => match self.keepalive_wait {
                Some(wait) => {
                    (self.last_packet + wait).saturating_duration_since(Instant::now())
                }
                None => FOREVER,
            },
        }
    }

    /// Frame and dispatch every complete packet buffered so far.
    async fn process_buf(&mut self, buf: &mut Vec<u8>) {
        loop {
            if self.status == Status::Disconnecting || self.status == Status::Disconnected {
                return;
            }
            match self.take_packet(buf) {
                Ok(Some((packet, n_bytes))) => {
                    self.last_packet = Instant::now();
                    let _ = self
                        .dispatcher_sender
                        .send(SessionToDispatcherCmd::PacketReceived(self.id, n_bytes))
                        .await;
                    self.handle_client_packet(packet).await;
                }
                Ok(None) => return,
                Err(FrameError::TooLarge) => {
                    log::error!("session: Inbound packet exceeds max size, id {}", self.id);
                    self.close(CloseReason::MaxRequestSize).await;
                    return;
                }
                Err(FrameError::Decode(err)) => {
                    // The Server MUST respond with return code 0x01 and close
                    // if the protocol level is not supported [MQTT-3.1.2-2];
                    // other malformed packets close without response.
                    if self.status == Status::Invalid
                        && matches!(
                            err,
                            DecodeError::InvalidProtocolLevel | DecodeError::InvalidProtocolName
                        )
                    {
                        let ack =
                            ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
                        let _ = self.send(ack).await;
                    }
                    log::error!("session: Malformed packet, id {}, {err:?}", self.id);
                    self.close(CloseReason::ProtocolError).await;
                    return;
                }
            }
        }
    }

    /// Pop one complete packet off the front of `buf`.
    ///
    /// Returns None while the fixed header or body is still incomplete;
    /// partial packets stay buffered.
    fn take_packet(&self, buf: &mut Vec<u8>) -> Result<Option<(Packet, usize)>, FrameError> {
        let mut ba = ByteArray::new(buf);
        let fixed_header = match FixedHeader::decode(&mut ba) {
            Ok(fixed_header) => fixed_header,
            Err(DecodeError::OutOfRange) => return Ok(None),
            Err(err) => return Err(FrameError::Decode(err)),
        };

        if fixed_header.remaining_length() > self.config.max_packet_size {
            return Err(FrameError::TooLarge);
        }

        let total = ba.offset() + fixed_header.remaining_length();
        if buf.len() < total {
            return Ok(None);
        }

        let mut packet_ba = ByteArray::new(&buf[..total]);
        let packet = Packet::decode(&mut packet_ba).map_err(FrameError::Decode)?;
        buf.drain(..total);
        Ok(Some((packet, total)))
    }

    async fn send<P: EncodePacket>(&mut self, packet: P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write(&buf).await?;
        let _ = self
            .dispatcher_sender
            .send(SessionToDispatcherCmd::PacketSent(self.id, buf.len()))
            .await;
        Ok(())
    }

    /// Tear the connection down, remembering `reason` for the dispatcher.
    async fn close(&mut self, reason: CloseReason) {
        if self.status == Status::Disconnected {
            return;
        }
        self.status = Status::Disconnecting;
        self.close_reason = reason;
        self.stream.shutdown().await;
        self.status = Status::Disconnected;
    }
}
