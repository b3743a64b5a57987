//! Typed status queries over the control link.

use crate::error::Result;
use crate::link::ControlLink;
use crate::types::is_built_circuit;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Keys fetched by one status query.
pub const STATUS_KEYS: &[&str] = &[
    "version",
    "status/bootstrap-phase",
    "status/circuit-established",
    "traffic/read",
    "traffic/written",
    "circuit-status",
];

/// Byte counters reported by Tor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    /// `traffic/read`.
    pub bytes_read: u64,
    /// `traffic/written`.
    pub bytes_written: u64,
}

/// One point-in-time view of the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Tor version string.
    pub version: String,
    /// Bootstrap progress, normally 0 to 100.
    pub bootstrap_phase: u32,
    /// Whether Tor reports a usable circuit.
    pub circuit_established: bool,
    /// Number of BUILT circuits.
    pub num_circuits: u32,
    /// Traffic counters.
    pub traffic: TrafficStats,
}

impl StatusSnapshot {
    /// Build a snapshot from GETINFO pairs. Missing or malformed fields
    /// default to zero/false/empty.
    pub fn from_info(info: &HashMap<String, String>) -> Self {
        let field = |key: &str| info.get(key).map(String::as_str).unwrap_or_default();

        Self {
            version: field("version").to_string(),
            bootstrap_phase: parse_bootstrap_progress(field("status/bootstrap-phase")),
            circuit_established: field("status/circuit-established") == "1",
            num_circuits: count_built_circuits(field("circuit-status")),
            traffic: TrafficStats {
                bytes_read: field("traffic/read").trim().parse().unwrap_or(0),
                bytes_written: field("traffic/written").trim().parse().unwrap_or(0),
            },
        }
    }

    /// Whether bootstrapping has finished.
    pub fn is_ready(&self) -> bool {
        self.bootstrap_phase >= 100
    }
}

/// Extract the number after `PROGRESS=` from a bootstrap-phase line.
pub fn parse_bootstrap_progress(phase: &str) -> u32 {
    phase
        .split_whitespace()
        .find_map(|token| token.strip_prefix("PROGRESS="))
        .map(|value| {
            let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .unwrap_or(0)
}

fn count_built_circuits(listing: &str) -> u32 {
    let built = listing.lines().filter(|line| is_built_circuit(line)).count();
    u32::try_from(built).unwrap_or(u32::MAX)
}

/// Reads [`StatusSnapshot`]s through a shared [`ControlLink`].
#[derive(Clone)]
pub struct StatusReader {
    link: Arc<ControlLink>,
}

impl StatusReader {
    /// Read through `link`.
    pub fn new(link: Arc<ControlLink>) -> Self {
        Self { link }
    }

    /// The link this reader queries.
    pub fn link(&self) -> &Arc<ControlLink> {
        &self.link
    }

    /// Query the daemon with one combined GETINFO.
    pub async fn get_status(&self) -> Result<StatusSnapshot> {
        let info = self.link.get_info(STATUS_KEYS).await?;
        Ok(StatusSnapshot::from_info(&info))
    }

    /// Whether bootstrap has reached 100. Query failures read as not ready.
    pub async fn is_ready(&self) -> bool {
        match self.get_status().await {
            Ok(snapshot) => snapshot.is_ready(),
            Err(err) => {
                debug!(error = %err, "status query failed, reporting not ready");
                false
            }
        }
    }
}
