//! # torwatch
//!
//! A sidecar that watches a Tor daemon through its control port and
//! publishes what it sees over HTTP.
//!
//! - [`link::ControlLink`] keeps one lazily (re)connected, authenticated
//!   control-port connection and serializes every exchange on it.
//! - [`status::StatusReader`] turns `GETINFO` answers into a
//!   [`status::StatusSnapshot`].
//! - [`readiness::ReadinessEvaluator`] classifies snapshots as healthy or
//!   unhealthy and raises edge-triggered notifications.
//! - [`egress::EgressVerifier`] checks through the SOCKS proxy that
//!   traffic actually leaves via Tor.
//! - [`notify::Dispatcher`] delivers notifications to a Discord, Slack,
//!   Gotify or plain JSON webhook without ever blocking the caller.
//! - [`server`] exposes all of it with axum, with Prometheus metrics.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use torwatch::{server, SidecarConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SidecarConfig::new()
//!         .control_address("127.0.0.1:9051")
//!         .control_password("secret")
//!         .http_port(8085);
//!     config.validate()?;
//!
//!     let shutdown = CancellationToken::new();
//!     server::run(&config, shutdown).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Querying Tor directly
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use torwatch::{ControlConfig, ControlLink, StatusReader};
//! # async fn example() -> torwatch::Result<()> {
//! let link = Arc::new(ControlLink::new(&ControlConfig::default()));
//! let reader = StatusReader::new(link.clone());
//!
//! let snapshot = reader.get_status().await?;
//! println!("bootstrap {}%, {} circuits", snapshot.bootstrap_phase, snapshot.num_circuits);
//!
//! link.signal(torwatch::Signal::NewNym).await?;
//! link.close().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod config;
pub mod egress;
pub mod error;
pub mod link;
pub mod metrics;
pub mod notify;
pub mod protocol;
pub mod readiness;
pub mod server;
pub mod status;
pub mod telemetry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

// Re-export main types for convenience
pub use error::{ControlError, NotifyError, Result};

pub use config::{ConfigError, ControlConfig, SidecarConfig, WebhookConfig};
pub use egress::{Dialect, EgressVerifier, VerificationEndpoint, VerificationResult};
pub use link::ControlLink;
pub use metrics::{MetricsSink, NullMetrics, PrometheusMetrics};
pub use notify::{
    Dispatcher, EventDetails, EventKind, NotificationEvent, Notify, PayloadFormat, Webhook,
};
pub use protocol::{Reply, ReplyLine};
pub use readiness::{ReadinessEvaluator, ReadinessTracker, Transition};
pub use server::{AppState, ServerError};
pub use status::{StatusReader, StatusSnapshot, TrafficStats};
pub use types::Signal;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build commit, when provided at compile time through `TORWATCH_COMMIT`.
pub const COMMIT: &str = match option_env!("TORWATCH_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};

/// `User-Agent` sent by egress probes and webhook deliveries.
pub const USER_AGENT: &str = concat!("torwatch/", env!("CARGO_PKG_VERSION"));
