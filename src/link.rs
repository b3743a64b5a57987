//! The shared control-port connection.
//!
//! [`ControlLink`] owns at most one TCP connection to Tor. It connects
//! lazily, authenticates with the configured secret, and runs every
//! command/reply exchange under a single async mutex so that concurrent
//! callers never interleave on the wire. Any failed exchange drops the
//! socket; the next call dials again.

use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::protocol::{format_command, quote_string, read_reply, Reply};
use crate::types::Signal;

use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

/// One open, authenticated control-port socket.
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn dial(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|err| ControlError::ConnectionFailed(format!("{}: {}", address, err)))?;

        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        })
    }

    /// Write one command and read its complete reply.
    async fn exchange(&mut self, command: &str) -> Result<Reply> {
        // Only the keyword is traced; AUTHENTICATE carries the secret.
        trace!(
            "Sending command: {}",
            command.split_whitespace().next().unwrap_or_default()
        );

        self.writer.write_all(command.as_bytes()).await?;
        self.writer.flush().await?;

        read_reply(&mut self.reader).await
    }

    async fn authenticate(&mut self, secret: &str) -> Result<()> {
        debug!("Authenticating with password");
        let cmd = format_command("AUTHENTICATE", &[&quote_string(secret)]);
        let reply = self.exchange(&cmd).await?;

        let first = reply.lines.first().map(|line| line.code).unwrap_or(0);
        if first != 250 {
            return Err(ControlError::AuthenticationFailed(reply.text()));
        }

        debug!("Authentication successful");
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        self.writer.write_all(b"QUIT\r\n").await?;
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Serialized, lazily (re)connecting client for Tor's control port.
pub struct ControlLink {
    address: String,
    password: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl ControlLink {
    /// Create a link; no connection is made until first use.
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            address: config.address.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            conn: Mutex::new(None),
        }
    }

    /// Address of the control port.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Connect and authenticate if not already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(())
    }

    async fn open(&self) -> Result<Connection> {
        debug!(address = %self.address, "connecting to tor control port");

        let mut conn = timeout(self.connect_timeout, Connection::dial(&self.address))
            .await
            .map_err(|_| ControlError::Timeout)??;

        if let Some(secret) = &self.password {
            // A failed handshake drops `conn` here, closing the socket.
            timeout(self.connect_timeout, conn.authenticate(secret))
                .await
                .map_err(|_| ControlError::Timeout)??;
        }

        Ok(conn)
    }

    /// Send a raw CRLF-terminated command and receive the reply.
    ///
    /// Connects first if needed. A non-success reply is returned as
    /// [`ControlError::CommandRejected`]. Any error discards the
    /// connection.
    ///
    /// The connection is out of the slot while the exchange runs and is
    /// only put back after a complete reply. If this future is dropped
    /// mid-exchange the socket goes with it, so no later command can read
    /// a stale reply.
    pub async fn send_command(&self, command: &str) -> Result<Reply> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.open().await?,
        };

        let result = match timeout(self.command_timeout, conn.exchange(command)).await {
            Ok(Ok(reply)) => {
                *guard = Some(conn);
                reply.into_result()
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ControlError::Timeout),
        };

        if let Err(err) = &result {
            debug!(error = %err, "discarding control connection");
            *guard = None;
        }

        result
    }

    /// Query several GETINFO keys in one exchange.
    pub async fn get_info(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let cmd = format_command("GETINFO", keys);
        let reply = self.send_command(&cmd).await?;
        Ok(reply.pairs())
    }

    /// Send a signal to Tor.
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        let cmd = format_command("SIGNAL", &[signal.as_str()]);
        self.send_command(&cmd).await?;
        Ok(())
    }

    /// Close the connection, if any. The link stays usable afterwards.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            debug!(address = %self.address, "closing tor control connection");
            match timeout(self.command_timeout, conn.quit()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "error while closing control connection"),
                Err(_) => debug!("timed out closing control connection"),
            }
        }
    }
}
