// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, ErrorKind};

/// Broker config, deserialized from a toml file.
///
/// Every field has a default so an empty file, or no file at all,
/// yields a working broker.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Interface address the listener binds to.
    ///
    /// Default is `0.0.0.0`.
    #[serde(default = "Config::default_listen_host")]
    listen_host: String,

    /// TCP port the listener binds to.
    ///
    /// Default is 1883.
    #[serde(default = "Config::default_listen_port")]
    listen_port: u16,

    /// Close the connection when the remaining length of an inbound packet
    /// exceeds this many bytes.
    ///
    /// Default is 2 MiB.
    #[serde(default = "Config::default_max_packet_size")]
    max_packet_size: usize,

    /// A client is disconnected when no control packet arrives within
    /// `keep_alive * keepalive_grace_multiplier` seconds.
    ///
    /// The protocol specifies one and a half times the keep alive
    /// period [MQTT-3.1.2-24], which is the default.
    #[serde(default = "Config::default_keepalive_grace_multiplier")]
    keepalive_grace_multiplier: f64,

    /// Time interval in seconds between `$SYS/broker/#` stats publications.
    ///
    /// Set to 0 to disable $SYS messages.
    ///
    /// Default is 10.
    #[serde(default = "Config::default_stats_publish_interval_secs")]
    stats_publish_interval_secs: u32,

    /// When a session's outbound byte backlog exceeds this mark, QoS 0
    /// messages to it are dropped and QoS 1/2 delivery pauses until the
    /// backlog drains.
    ///
    /// Default is 16 MiB.
    #[serde(default = "Config::default_outbound_highwater_bytes")]
    outbound_highwater_bytes: usize,

    /// Accept connections that carry no username.
    ///
    /// Default is true.
    #[serde(default = "Config::default_allow_anonymous")]
    allow_anonymous: bool,

    /// Close a connection that does not send a Connect packet within this
    /// many seconds. 0 disables the check.
    ///
    /// Default is 30.
    #[serde(default = "Config::default_connect_timeout_secs")]
    connect_timeout_secs: u64,

    /// Cap on the granted QoS of subscriptions; requests above it are
    /// granted this value.
    ///
    /// Default is 2.
    #[serde(default = "Config::default_max_qos")]
    max_qos: QoS,

    #[serde(default)]
    log: Log,
}

impl Config {
    pub fn default_listen_host() -> String {
        "0.0.0.0".to_string()
    }

    pub const fn default_listen_port() -> u16 {
        1883
    }

    pub const fn default_max_packet_size() -> usize {
        2 * 1024 * 1024
    }

    pub const fn default_keepalive_grace_multiplier() -> f64 {
        1.5
    }

    pub const fn default_stats_publish_interval_secs() -> u32 {
        10
    }

    pub const fn default_outbound_highwater_bytes() -> usize {
        16 * 1024 * 1024
    }

    pub const fn default_allow_anonymous() -> bool {
        true
    }

    pub const fn default_connect_timeout_secs() -> u64 {
        30
    }

    pub const fn default_max_qos() -> QoS {
        QoS::ExactOnce
    }

    /// Read config from a toml file at `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Failed to read config file {:?}, {err}", path.as_ref()),
            )
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check config values are in their valid ranges.
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.listen_port == 0 {
            return Err(Error::new(ErrorKind::ConfigError, "listen_port must not be 0"));
        }
        if self.max_packet_size > codec::MAX_REMAINING_LENGTH {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!(
                    "max_packet_size exceeds protocol limit {}",
                    codec::MAX_REMAINING_LENGTH
                ),
            ));
        }
        if self.keepalive_grace_multiplier < 1.0 {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "keepalive_grace_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn listen_host(&self) -> &str {
        &self.listen_host
    }

    #[must_use]
    pub const fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Listener bind address, `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    #[must_use]
    pub const fn keepalive_grace_multiplier(&self) -> f64 {
        self.keepalive_grace_multiplier
    }

    #[must_use]
    pub const fn stats_publish_interval_secs(&self) -> u32 {
        self.stats_publish_interval_secs
    }

    #[must_use]
    pub const fn outbound_highwater_bytes(&self) -> usize {
        self.outbound_highwater_bytes
    }

    #[must_use]
    pub const fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    #[must_use]
    pub const fn connect_timeout_secs(&self) -> u64 {
        self.connect_timeout_secs
    }

    #[must_use]
    pub const fn max_qos(&self) -> QoS {
        self.max_qos
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: Self::default_listen_host(),
            listen_port: Self::default_listen_port(),
            max_packet_size: Self::default_max_packet_size(),
            keepalive_grace_multiplier: Self::default_keepalive_grace_multiplier(),
            stats_publish_interval_secs: Self::default_stats_publish_interval_secs(),
            outbound_highwater_bytes: Self::default_outbound_highwater_bytes(),
            allow_anonymous: Self::default_allow_anonymous(),
            connect_timeout_secs: Self::default_connect_timeout_secs(),
            max_qos: Self::default_max_qos(),
            log: Log::default(),
        }
    }
}

/// Log section in config.
#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    /// Default is `info`.
    #[serde(default = "Log::default_level")]
    level: LogLevel,
}

impl Log {
    pub const fn default_level() -> LogLevel {
        LogLevel::Info
    }

    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
