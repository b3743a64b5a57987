//! Small protocol vocabulary shared by the control link and status reader.

use std::fmt;

/// Signals the sidecar may send with `SIGNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Switch to clean circuits.
    NewNym,
}

impl Signal {
    /// Get the signal name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::NewNym => "NEWNYM",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a `circuit-status` entry reports its circuit as built.
///
/// Entries look like `<id> <status> [path] [flags...]`.
pub fn is_built_circuit(entry: &str) -> bool {
    entry
        .split_whitespace()
        .nth(1)
        .is_some_and(|status| status.eq_ignore_ascii_case("BUILT"))
}
