// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

/// A duplex socket connection to a client.
#[derive(Debug)]
pub struct Stream(TcpStream);

impl Stream {
    /// Wrap an accepted tcp stream, disabling Nagle's algorithm.
    ///
    /// # Errors
    ///
    /// Returns error if socket options cannot be set.
    pub fn new(tcp_stream: TcpStream) -> Result<Self, Error> {
        tcp_stream.set_nodelay(true)?;
        Ok(Self(tcp_stream))
    }

    /// Read available bytes into `buf`, appending to its end.
    ///
    /// Returns 0 when the peer has closed the socket.
    ///
    /// # Errors
    ///
    /// Returns error if socket read fails.
    pub async fn read_buf(&mut self, buf: &mut Vec<u8>) -> Result<usize, Error> {
        Ok(self.0.read_buf(buf).await?)
    }

    /// Write the whole of `buf` to the socket.
    ///
    /// # Errors
    ///
    /// Returns error if socket write fails.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.0.write_all(buf).await?;
        Ok(buf.len())
    }

    /// Shut down the write half, flushing queued bytes best-effort.
    pub async fn shutdown(&mut self) {
        let _ = self.0.shutdown().await;
    }
}
