// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use log::LevelFilter;

use crate::config;
use crate::error::{Error, ErrorKind};

fn get_log_level(level: config::LogLevel) -> LevelFilter {
    match level {
        config::LogLevel::Off => LevelFilter::Off,
        config::LogLevel::Error => LevelFilter::Error,
        config::LogLevel::Warn => LevelFilter::Warn,
        config::LogLevel::Info => LevelFilter::Info,
        config::LogLevel::Debug => LevelFilter::Debug,
        config::LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Initialize the global logger with the level from config.
///
/// `RUST_LOG` overrides the config value.
///
/// # Errors
///
/// Returns error if a global logger is already installed.
pub fn init_log(log_conf: &config::Log) -> Result<(), Error> {
    env_logger::Builder::from_default_env()
        .filter_level(get_log_level(log_conf.level()))
        .try_init()
        .map_err(|err| {
            Error::from_string(
                ErrorKind::LoggerError,
                format!("Failed to init logger, {err}"),
            )
        })
}
