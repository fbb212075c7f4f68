// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Broker-wide counters and periodic `$SYS/broker/#` publication.

use codec::{PublishPacket, QoS};
use std::time::Instant;

use super::Dispatcher;
use crate::types::Uptime;

pub const SYS_UPTIME: &str = "$SYS/broker/uptime";
pub const SYS_CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
pub const SYS_CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
pub const SYS_BYTES_RECEIVED: &str = "$SYS/broker/bytes/received";
pub const SYS_BYTES_SENT: &str = "$SYS/broker/bytes/sent";
pub const SYS_MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
pub const SYS_MESSAGES_SENT: &str = "$SYS/broker/messages/sent";

/// Monotonic traffic counters, mutated only from the dispatcher task.
///
/// Client counts are gauges read off the session store.
#[derive(Debug)]
pub(super) struct Stats {
    start_time: Instant,
    pub nconnections: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub messages_recv: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            nconnections: 0,
            bytes_recv: 0,
            bytes_sent: 0,
            messages_recv: 0,
            messages_sent: 0,
            messages_dropped: 0,
        }
    }

    pub fn uptime(&self) -> Uptime {
        self.start_time.elapsed().as_secs()
    }
}

impl Dispatcher {
    /// Periodic housekeeping: retry paused deliveries, then publish the
    /// `$SYS` tree as retained messages with UTF-8 decimal payloads.
    pub(super) async fn handle_sys_tick(&mut self) {
        for client_id in self.store.blocked_client_ids() {
            self.flush_blocked(&client_id).await;
        }

        log::debug!(
            "dispatcher: {} connections accepted, {} messages dropped",
            self.stats.nconnections,
            self.stats.messages_dropped
        );

        if self.config.sys_interval.is_zero() {
            return;
        }

        let entries = [
            (SYS_UPTIME, self.stats.uptime().to_string()),
            (
                SYS_CLIENTS_CONNECTED,
                self.store.connected_count().to_string(),
            ),
            (SYS_CLIENTS_TOTAL, self.store.total_count().to_string()),
            (SYS_BYTES_RECEIVED, self.stats.bytes_recv.to_string()),
            (SYS_BYTES_SENT, self.stats.bytes_sent.to_string()),
            (SYS_MESSAGES_RECEIVED, self.stats.messages_recv.to_string()),
            (SYS_MESSAGES_SENT, self.stats.messages_sent.to_string()),
        ];
        for (topic, payload) in entries {
            let Ok(mut packet) = PublishPacket::new(topic, QoS::AtMostOnce, payload.as_bytes())
            else {
                continue;
            };
            packet.set_retain(true);
            self.sub_trie.retain(&packet);
            self.route_publish(&packet).await;
        }
    }
}
