// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Shared helpers: an in-process broker and a raw MQTT client over a
//! plain tcp stream.

#![allow(dead_code)]

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use codec::{
    ByteArray, ConnectAckPacket, ConnectFlags, ConnectPacket, ConnectReturnCode, DecodePacket,
    EncodePacket, FixedHeader, Packet, PacketId, QoS, SubscribeAck, SubscribePacket,
};
use weir::config::Config;
use weir::server::ServerContext;

/// Start a broker on `127.0.0.1:port` inside the current runtime and wait
/// until it accepts connections.
pub async fn start_broker(port: u16) {
    let content = format!(
        "listen_host = \"127.0.0.1\"\nlisten_port = {port}\nstats_publish_interval_secs = 1\n"
    );
    let config: Config = toml::from_str(&content).unwrap();
    tokio::spawn(async move {
        let mut server = ServerContext::new(config);
        let _ = server.run().await;
    });

    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("Broker did not start listening on port {port}");
}

/// Raw MQTT client speaking the codec directly.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub async fn dial(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Dial and complete the Connect handshake, expecting acceptance.
    pub async fn handshake(port: u16, client_id: &str, clean_session: bool) -> Self {
        let mut packet = ConnectPacket::new(client_id).unwrap();
        let mut flags = ConnectFlags::default();
        flags.set_clean_session(clean_session);
        packet.set_connect_flags(flags);
        let (client, ack) = Self::handshake_with(port, packet).await;
        assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
        client
    }

    /// Dial and send a prepared Connect packet, returning the ConnectAck.
    pub async fn handshake_with(port: u16, packet: ConnectPacket) -> (Self, ConnectAckPacket) {
        let mut client = Self::dial(port).await;
        client.send(&packet).await;
        match client.recv_packet().await {
            Packet::ConnectAck(ack) => (client, ack),
            packet => panic!("Expected ConnectAck, got {packet:?}"),
        }
    }

    pub async fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        self.stream.write_all(&buf).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Subscribe to one filter and check the granted QoS in the ack.
    pub async fn subscribe(&mut self, filter: &str, qos: QoS, packet_id: u16) {
        let packet = SubscribePacket::new(filter, qos, PacketId::new(packet_id)).unwrap();
        self.send(&packet).await;
        match self.recv_packet().await {
            Packet::SubscribeAck(ack) => {
                assert_eq!(ack.packet_id(), PacketId::new(packet_id));
                assert_eq!(ack.acknowledgements(), &[SubscribeAck::QoS(qos)]);
            }
            packet => panic!("Expected SubscribeAck, got {packet:?}"),
        }
    }

    /// Read the next complete packet, waiting up to five seconds.
    pub async fn recv_packet(&mut self) -> Packet {
        self.try_recv_packet(Duration::from_secs(5))
            .await
            .expect("Timed out waiting for a packet")
    }

    /// Read the next complete packet or return None when `wait` elapses or
    /// the peer closes the connection first.
    pub async fn try_recv_packet(&mut self, wait: Duration) -> Option<Packet> {
        timeout(wait, self.recv_inner()).await.ok().flatten()
    }

    async fn recv_inner(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.parse_buffered() {
                return Some(packet);
            }
            let n_recv = self.stream.read_buf(&mut self.buf).await.ok()?;
            if n_recv == 0 {
                return None;
            }
        }
    }

    fn parse_buffered(&mut self) -> Option<Packet> {
        let mut ba = ByteArray::new(&self.buf);
        let fixed_header = FixedHeader::decode(&mut ba).ok()?;
        let total = ba.offset() + fixed_header.remaining_length();
        if self.buf.len() < total {
            return None;
        }

        let mut packet_ba = ByteArray::new(&self.buf[..total]);
        let packet = Packet::decode(&mut packet_ba).expect("Malformed packet from broker");
        self.buf.drain(..total);
        Some(packet)
    }

    /// Read exactly `len` raw bytes.
    pub async fn recv_exact(&mut self, len: usize) -> Vec<u8> {
        while self.buf.len() < len {
            let n_recv = timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf))
                .await
                .expect("Timed out waiting for bytes")
                .unwrap();
            assert!(n_recv > 0, "Connection closed early");
        }
        self.buf.drain(..len).collect()
    }

    /// True when the broker closes the connection without further data.
    pub async fn eof(&mut self) -> bool {
        matches!(
            timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf)).await,
            Ok(Ok(0))
        )
    }
}
