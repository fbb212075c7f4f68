// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Sender};

use crate::commands::SessionToDispatcherCmd;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::session::{Session, SessionConfig};
use crate::stream::Stream;
use crate::types::SessionId;

/// Capacity of each connection's command channel from the dispatcher.
const SESSION_CHANNEL_CAPACITY: usize = 128;

/// Accepts client connections and spawns one session task per socket.
pub struct Listener {
    listener: TcpListener,
    session_config: SessionConfig,
    dispatcher_sender: Sender<SessionToDispatcherCmd>,
    next_session_id: SessionId,
}

impl Listener {
    /// Bind the listen socket.
    ///
    /// # Errors
    ///
    /// Returns error if the configured address cannot be bound; the caller
    /// treats this as fatal.
    pub async fn bind(
        config: &Config,
        dispatcher_sender: Sender<SessionToDispatcherCmd>,
    ) -> Result<Self, Error> {
        let address = config.address();
        let listener = TcpListener::bind(&address).await.map_err(|err| {
            Error::from_string(
                ErrorKind::SocketError,
                format!("Failed to bind to address {address}, {err}"),
            )
        })?;
        log::info!("listener: Listening at {address}");

        Ok(Self {
            listener,
            session_config: SessionConfig::new(
                config.max_packet_size(),
                config.connect_timeout_secs(),
                config.keepalive_grace_multiplier(),
            ),
            dispatcher_sender,
            next_session_id: 0,
        })
    }

    pub async fn run_loop(&mut self) {
        loop {
            match self.listener.accept().await {
                Ok((tcp_stream, address)) => match Stream::new(tcp_stream) {
                    Ok(stream) => {
                        self.next_session_id += 1;
                        let session_id = self.next_session_id;
                        log::info!("listener: New connection from {address}, id {session_id}");

                        let (cmd_sender, cmd_receiver) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
                        let session = Session::new(
                            session_id,
                            self.session_config.clone(),
                            stream,
                            self.dispatcher_sender.clone(),
                            cmd_sender,
                            cmd_receiver,
                        );
                        tokio::spawn(session.run_loop());
                    }
                    Err(err) => {
                        log::error!("listener: Failed to prepare socket of {address}, {err}");
                    }
                },
                Err(err) => {
                    // Transient accept failures are logged and retried.
                    log::error!("listener: Failed to accept connection, {err}");
                }
            }
        }
    }
}
