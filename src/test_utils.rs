//! # Test utilities
//!
//! Reply builders, canned fixtures, and a scripted control-port double
//! for testing code that talks to Tor.
//!
//! Compiled for this crate's own tests, and for dependents that enable the
//! `test-utils` feature:
//!
//! ```toml
//! [dev-dependencies]
//! torwatch = { version = "0.1", features = ["test-utils"] }
//! ```
//!
//! ## Mock server
//!
//! [`MockControlServer`] listens on an ephemeral local port and answers
//! `AUTHENTICATE`, `GETINFO`, `SIGNAL` and `QUIT` from a shared [`MockTor`]
//! state. It records every command line it receives and counts commands
//! that arrived while a previous reply was still pending, which makes it
//! suitable for asserting that writes are serialized.
//!
//! ## Recording doubles
//!
//! [`RecordingMetrics`] and [`RecordingNotifier`] stand in for the
//! Prometheus sink and the webhook dispatcher and keep everything they
//! are handed.
//!
//! ```rust,ignore
//! use torwatch::test_utils::{MockControlServer, MockTor};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let tor = MockTor::new(100);
//!     let server = MockControlServer::start(tor.clone()).await.unwrap();
//!     // point a ControlLink at server.address() ...
//!     tor.set_bootstrap(40);
//! }
//! ```

use crate::metrics::MetricsSink;
use crate::notify::{NotificationEvent, Notify};
use crate::protocol::quote_string;
use crate::status::StatusSnapshot;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Canned control-port replies.
pub mod fixtures {
    /// Version string reported by the mock.
    pub const TOR_VERSION: &str = "0.4.8.12";

    /// Sample AUTHENTICATE OK response.
    pub fn auth_ok_response() -> &'static str {
        "250 OK\r\n"
    }

    /// Sample AUTHENTICATE failure response.
    pub fn auth_failed_response() -> &'static str {
        "515 Authentication failed: Password did not match HashedControlPassword value from configuration\r\n"
    }

    /// `status/bootstrap-phase` value for a given progress.
    pub fn bootstrap_phase(progress: u32) -> String {
        if progress >= 100 {
            "NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"".to_string()
        } else {
            format!(
                "NOTICE BOOTSTRAP PROGRESS={} TAG=loading_descriptors SUMMARY=\"Loading relay descriptors\"",
                progress
            )
        }
    }

    /// `circuit-status` body with `built` BUILT circuits and one LAUNCHED.
    pub fn circuit_status(built: u32) -> String {
        let mut lines: Vec<String> = (1..=built)
            .map(|id| {
                format!(
                    "{} BUILT $9695DFC35FFEB861329B9F1AB04C46397020CE31~relay{},$AAAA~exit PURPOSE=GENERAL",
                    id, id
                )
            })
            .collect();
        lines.push(format!("{} LAUNCHED PURPOSE=GENERAL", built + 1));
        lines.join("\n")
    }

    /// Sample error response.
    pub fn error_response() -> &'static str {
        "552 Unrecognized key\r\n"
    }
}

/// Control-port reply builder.
///
/// Helps construct properly formatted replies for testing parsers.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    lines: Vec<String>,
}

impl MockReply {
    /// Create a new empty reply builder.
    pub fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Create a simple OK reply.
    pub fn ok() -> Self {
        Self {
            lines: vec!["250 OK".to_string()],
        }
    }

    /// Create an error reply.
    pub fn error(code: u16, message: &str) -> Self {
        Self {
            lines: vec![format!("{} {}", code, message)],
        }
    }

    /// Add a `250-key=value` line.
    pub fn data_line(mut self, line: &str) -> Self {
        self.lines.push(format!("250-{}", line));
        self
    }

    /// Add a `250+key=` data block, dot-escaping its lines.
    pub fn data_block(mut self, key: &str, body: &str) -> Self {
        self.lines.push(format!("250+{}=", key));
        for line in body.lines() {
            if line.starts_with('.') {
                self.lines.push(format!(".{}", line));
            } else {
                self.lines.push(line.to_string());
            }
        }
        self.lines.push(".".to_string());
        self
    }

    /// Add the final OK line.
    pub fn finish(mut self) -> Self {
        self.lines.push("250 OK".to_string());
        self
    }

    /// Build the reply as a string.
    pub fn build(&self) -> String {
        self.lines.iter().map(|l| format!("{}\r\n", l)).collect()
    }
}

/// What the mock server does with one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockAction {
    /// Write these bytes.
    Reply(String),
    /// Write these bytes, then close the connection.
    ReplyAndClose(String),
    /// Close the connection without replying.
    Close,
    /// Never answer.
    Silent,
}

#[derive(Debug, Default)]
struct MockTorInner {
    bootstrap: AtomicU32,
    circuits: AtomicU32,
    password: Mutex<Option<String>>,
    drop_next: AtomicBool,
    reject_signals: AtomicBool,
    fail_getinfo: AtomicBool,
    silent: AtomicBool,
}

/// Shared, mutable state of a simulated Tor daemon.
#[derive(Debug, Clone, Default)]
pub struct MockTor {
    inner: Arc<MockTorInner>,
}

impl MockTor {
    /// A daemon at the given bootstrap progress with three built circuits.
    pub fn new(bootstrap: u32) -> Self {
        let tor = Self::default();
        tor.set_bootstrap(bootstrap);
        tor.inner.circuits.store(3, Ordering::SeqCst);
        tor
    }

    /// Require this password in AUTHENTICATE.
    pub fn with_password(self, password: &str) -> Self {
        if let Ok(mut guard) = self.inner.password.lock() {
            *guard = Some(password.to_string());
        }
        self
    }

    /// Change the reported bootstrap progress.
    pub fn set_bootstrap(&self, progress: u32) {
        self.inner.bootstrap.store(progress, Ordering::SeqCst);
    }

    /// Close the connection upon the next command instead of answering.
    pub fn drop_next_command(&self) {
        self.inner.drop_next.store(true, Ordering::SeqCst);
    }

    /// Answer SIGNAL with 552.
    pub fn reject_signals(&self, reject: bool) {
        self.inner.reject_signals.store(reject, Ordering::SeqCst);
    }

    /// Answer GETINFO with 551.
    pub fn fail_getinfo(&self, fail: bool) {
        self.inner.fail_getinfo.store(fail, Ordering::SeqCst);
    }

    /// Stop answering commands.
    pub fn go_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::SeqCst);
    }

    /// Decide how to answer one command line.
    pub fn respond(&self, command: &str) -> MockAction {
        if self.inner.drop_next.swap(false, Ordering::SeqCst) {
            return MockAction::Close;
        }
        if self.inner.silent.load(Ordering::SeqCst) {
            return MockAction::Silent;
        }

        let (keyword, args) = command.split_once(' ').unwrap_or((command, ""));

        match keyword {
            "AUTHENTICATE" => {
                let expected = self
                    .inner
                    .password
                    .lock()
                    .ok()
                    .and_then(|guard| guard.clone());
                match expected {
                    Some(password) if quote_string(&password) != args => {
                        MockAction::Reply(fixtures::auth_failed_response().to_string())
                    }
                    _ => MockAction::Reply(fixtures::auth_ok_response().to_string()),
                }
            }
            "GETINFO" if self.inner.fail_getinfo.load(Ordering::SeqCst) => {
                MockAction::Reply(MockReply::error(551, "Internal error").build())
            }
            "GETINFO" => MockAction::Reply(self.getinfo(args.split_whitespace())),
            "SIGNAL" => {
                if self.inner.reject_signals.load(Ordering::SeqCst) {
                    MockAction::Reply(format!("552 Unrecognized signal code \"{}\"\r\n", args))
                } else {
                    MockAction::Reply(MockReply::ok().build())
                }
            }
            "QUIT" => MockAction::ReplyAndClose("250 closing connection\r\n".to_string()),
            _ => MockAction::Reply(format!("510 Unrecognized command \"{}\"\r\n", keyword)),
        }
    }

    fn getinfo<'a>(&self, keys: impl Iterator<Item = &'a str>) -> String {
        let bootstrap = self.inner.bootstrap.load(Ordering::SeqCst);
        let circuits = self.inner.circuits.load(Ordering::SeqCst);
        let mut reply = MockReply::new();

        for key in keys {
            reply = match key {
                "version" => reply.data_line(&format!("version={}", fixtures::TOR_VERSION)),
                "status/bootstrap-phase" => reply.data_line(&format!(
                    "status/bootstrap-phase={}",
                    fixtures::bootstrap_phase(bootstrap)
                )),
                "status/circuit-established" => reply.data_line(&format!(
                    "status/circuit-established={}",
                    if bootstrap >= 100 { 1 } else { 0 }
                )),
                "traffic/read" => reply.data_line("traffic/read=1024"),
                "traffic/written" => reply.data_line("traffic/written=2048"),
                "circuit-status" => {
                    reply.data_block("circuit-status", &fixtures::circuit_status(circuits))
                }
                other => return MockReply::error(552, &format!("Unrecognized key \"{}\"", other)).build(),
            };
        }

        reply.finish().build()
    }
}

#[derive(Debug, Default)]
struct ServerLog {
    commands: Mutex<Vec<String>>,
    connections: AtomicUsize,
    pipelined: AtomicUsize,
}

/// Scripted control-port server on an ephemeral local port.
pub struct MockControlServer {
    addr: SocketAddr,
    log: Arc<ServerLog>,
    handle: JoinHandle<()>,
}

impl MockControlServer {
    /// Start serving `tor` immediately.
    pub async fn start(tor: MockTor) -> std::io::Result<Self> {
        Self::start_with_delay(tor, Duration::ZERO).await
    }

    /// Start serving `tor`, pausing `delay` before each reply.
    pub async fn start_with_delay(tor: MockTor, delay: Duration) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let log = Arc::new(ServerLog::default());

        let accept_log = Arc::clone(&log);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_log.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    stream,
                    tor.clone(),
                    Arc::clone(&accept_log),
                    delay,
                ));
            }
        });

        Ok(Self { addr, log, handle })
    }

    /// `host:port` to dial.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Every command line received so far, without CRLF.
    pub fn commands(&self) -> Vec<String> {
        self.log
            .commands
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Number of accepted connections.
    pub fn connections(&self) -> usize {
        self.log.connections.load(Ordering::SeqCst)
    }

    /// Commands that arrived before the previous one was answered.
    pub fn pipelined(&self) -> usize {
        self.log.pipelined.load(Ordering::SeqCst)
    }
}

impl Drop for MockControlServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(stream: TcpStream, tor: MockTor, log: Arc<ServerLog>, delay: Duration) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        let command = line.trim_end_matches(['\r', '\n']).to_string();
        if !reader.buffer().is_empty() {
            log.pipelined.fetch_add(1, Ordering::SeqCst);
        }
        if let Ok(mut commands) = log.commands.lock() {
            commands.push(command.clone());
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match tor.respond(&command) {
            MockAction::Reply(bytes) => {
                if write_half.write_all(bytes.as_bytes()).await.is_err() {
                    return;
                }
            }
            MockAction::ReplyAndClose(bytes) => {
                let _ = write_half.write_all(bytes.as_bytes()).await;
                return;
            }
            MockAction::Close => return,
            MockAction::Silent => {}
        }
    }
}

/// [`MetricsSink`] that keeps what it was told.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    requests: Mutex<Vec<(String, String, u16)>>,
    statuses: Mutex<Vec<StatusSnapshot>>,
    ready: Mutex<Vec<bool>>,
    checks: Mutex<Vec<(String, bool, bool)>>,
    webhooks: Mutex<Vec<(String, String)>>,
}

fn snapshot_of<T: Clone>(items: &Mutex<Vec<T>>) -> Vec<T> {
    items.lock().map(|guard| guard.clone()).unwrap_or_default()
}

fn record<T>(items: &Mutex<Vec<T>>, item: T) {
    if let Ok(mut guard) = items.lock() {
        guard.push(item);
    }
}

impl RecordingMetrics {
    /// `(path, method, status)` per request.
    pub fn requests(&self) -> Vec<(String, String, u16)> {
        snapshot_of(&self.requests)
    }

    /// Status snapshots observed.
    pub fn statuses(&self) -> Vec<StatusSnapshot> {
        snapshot_of(&self.statuses)
    }

    /// Readiness flags observed.
    pub fn ready(&self) -> Vec<bool> {
        snapshot_of(&self.ready)
    }

    /// `(endpoint, success, is_tor)` per probe attempt.
    pub fn checks(&self) -> Vec<(String, bool, bool)> {
        snapshot_of(&self.checks)
    }

    /// `(event, status)` per webhook outcome.
    pub fn webhooks(&self) -> Vec<(String, String)> {
        snapshot_of(&self.webhooks)
    }
}

impl MetricsSink for RecordingMetrics {
    fn http_request(&self, path: &str, method: &str, status: u16, _: Duration) {
        record(&self.requests, (path.to_string(), method.to_string(), status));
    }

    fn tor_status(&self, snapshot: &StatusSnapshot) {
        record(&self.statuses, snapshot.clone());
    }

    fn tor_ready(&self, ready: bool) {
        record(&self.ready, ready);
    }

    fn external_check(&self, endpoint: &str, success: bool, is_tor: bool) {
        record(&self.checks, (endpoint.to_string(), success, is_tor));
    }

    fn webhook_request(&self, event: &str, status: &str, _: Option<Duration>) {
        record(&self.webhooks, (event.to_string(), status.to_string()));
    }
}

/// [`Notify`] that keeps every event instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    /// Events handed off so far.
    pub fn events(&self) -> Vec<NotificationEvent> {
        snapshot_of(&self.events)
    }
}

impl Notify for RecordingNotifier {
    fn notify(&self, event: NotificationEvent) {
        record(&self.events, event);
    }
}
