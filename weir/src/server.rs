// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! `ServerContext` is the main entry point of the broker.

use clap::{Arg, ArgAction};
use std::path::Path;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::auth::AnonymousAuth;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::listener::Listener;
use crate::log::init_log;

/// Capacity of the shared command channel into the dispatcher.
pub const DISPATCHER_CHANNEL_CAPACITY: usize = 1024;

pub const DEFAULT_CONFIG: &str = "/etc/weir/weir.toml";
const OPT_CONFIG: &str = "config";
const OPT_TEST: &str = "test";

/// Wires config, dispatcher and listener together and waits for
/// kernel signals.
pub struct ServerContext {
    config: Config,
}

impl ServerContext {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Validate config and run the broker on `runtime` until a termination
    /// signal arrives.
    ///
    /// # Errors
    ///
    /// Returns error if config is invalid or the listener cannot be bound.
    pub fn run_loop(&mut self, runtime: &Runtime) -> Result<(), Error> {
        self.config.validate()?;
        runtime.block_on(self.run())
    }

    /// Bind the listener, spawn the dispatcher and accept-loop tasks, then
    /// park on the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns error if the listener cannot be bound or signal handlers
    /// cannot be installed.
    pub async fn run(&mut self) -> Result<(), Error> {
        let (dispatcher_sender, dispatcher_receiver) = mpsc::channel(DISPATCHER_CHANNEL_CAPACITY);
        let auth = Box::new(AnonymousAuth::new(self.config.allow_anonymous()));
        let mut dispatcher = Dispatcher::new(&self.config, auth, dispatcher_receiver);
        let mut listener = Listener::bind(&self.config, dispatcher_sender).await?;

        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run_loop().await;
        });
        let listener_handle = tokio::spawn(async move {
            listener.run_loop().await;
        });

        wait_for_signal().await?;
        log::info!("server: Shutting down");
        listener_handle.abort();
        dispatcher_handle.abort();
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<(), Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm_stream = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("server: Quit with SIGINT");
        }
        _ = sigterm_stream.recv() => {
            log::info!("server: Quit with SIGTERM");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<(), Error> {
    tokio::signal::ctrl_c().await?;
    log::info!("server: Quit with SIGINT");
    Ok(())
}

/// Entry point of the server binary.
///
/// # Errors
///
/// Returns error if config is invalid or the broker fails to start; the
/// error's `exit_code()` becomes the process exit status.
pub fn run_server() -> Result<(), Error> {
    let matches = clap::Command::new("Weir")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Xu Shaohua <shaohua@biofan.org>")
        .about("Lightweight MQTT broker")
        .arg(
            Arg::new(OPT_CONFIG)
                .short('c')
                .long(OPT_CONFIG)
                .value_name("config_file")
                .help("Specify config file path"),
        )
        .arg(
            Arg::new(OPT_TEST)
                .short('t')
                .long(OPT_TEST)
                .action(ArgAction::SetTrue)
                .help("Test config file and exit"),
        )
        .get_matches();

    let config = if let Some(config_file) = matches.get_one::<String>(OPT_CONFIG) {
        Config::load(config_file)?
    } else if Path::new(DEFAULT_CONFIG).exists() {
        Config::load(DEFAULT_CONFIG)?
    } else {
        Config::default()
    };

    if matches.get_flag(OPT_TEST) {
        println!("The configuration file is ok");
        return Ok(());
    }

    init_log(config.log())?;

    let runtime = Runtime::new()?;
    let mut server = ServerContext::new(config);
    server.run_loop(&runtime)
}
