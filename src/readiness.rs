//! Edge-triggered readiness evaluation.
//!
//! Every readiness check classifies Tor as healthy (bootstrap finished) or
//! unhealthy (link error or bootstrap below 100). A [`ReadinessTracker`]
//! remembers the previous class and reports whether it changed. Each check
//! raises at most one notification:
//!
//! - class changed: `health_changed` with the new class;
//! - unhealthy without a change (including the very first check):
//!   `bootstrap_failed` with the cause;
//! - healthy without a change: nothing.

use crate::metrics::MetricsSink;
use crate::notify::{EventDetails, EventKind, NotificationEvent, Notify};
use crate::status::{StatusReader, StatusSnapshot};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Result of feeding one classification to a [`ReadinessTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First observation; nothing to compare against.
    Baseline,
    /// Same class as before.
    Unchanged,
    /// Class flipped; carries the new class.
    Changed(bool),
}

/// Stored health class.
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    healthy: Mutex<Option<bool>>,
}

impl ReadinessTracker {
    /// A tracker with no observation yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `healthy` and report how it relates to the previous class.
    pub fn observe(&self, healthy: bool) -> Transition {
        let mut stored = match self.healthy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let transition = match *stored {
            None => Transition::Baseline,
            Some(previous) if previous == healthy => Transition::Unchanged,
            Some(_) => Transition::Changed(healthy),
        };
        *stored = Some(healthy);

        transition
    }

    /// Last recorded class, if any.
    pub fn current(&self) -> Option<bool> {
        match self.healthy.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Why a check came out unhealthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhealthyCause {
    /// The status query failed.
    Unreachable(String),
    /// Tor answered but is still bootstrapping.
    Bootstrapping {
        /// Reported bootstrap progress.
        bootstrap: u32,
        /// Built circuits at the time of the check.
        circuits: u32,
    },
}

/// Pick the notification, if any, for one check.
pub fn decide_event(
    transition: Transition,
    cause: Option<&UnhealthyCause>,
) -> Option<NotificationEvent> {
    if let Transition::Changed(healthy) = transition {
        let message = if healthy {
            "Tor health status changed to healthy"
        } else {
            "Tor health status changed to unhealthy"
        };
        return Some(NotificationEvent::new(
            EventKind::HealthChanged,
            message,
            EventDetails {
                healthy,
                ..EventDetails::default()
            },
        ));
    }

    match cause? {
        UnhealthyCause::Unreachable(error) => Some(NotificationEvent::new(
            EventKind::BootstrapFailed,
            "Tor bootstrap failed",
            EventDetails {
                error: Some(error.clone()),
                ..EventDetails::default()
            },
        )),
        UnhealthyCause::Bootstrapping {
            bootstrap,
            circuits,
        } => Some(NotificationEvent::new(
            EventKind::BootstrapFailed,
            "Tor bootstrap incomplete",
            EventDetails {
                bootstrap: Some(*bootstrap),
                circuits: *circuits,
                ..EventDetails::default()
            },
        )),
    }
}

/// Outcome of [`ReadinessEvaluator::evaluate`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Whether Tor came out healthy.
    pub ready: bool,
    /// How this check relates to the previous one.
    pub transition: Transition,
    /// Snapshot, when the status query succeeded.
    pub snapshot: Option<StatusSnapshot>,
}

/// Runs readiness checks and raises notifications on their outcome.
pub struct ReadinessEvaluator {
    reader: StatusReader,
    tracker: ReadinessTracker,
    notifier: Arc<dyn Notify>,
    metrics: Arc<dyn MetricsSink>,
}

impl ReadinessEvaluator {
    /// Evaluate through `reader`, reporting to `notifier` and `metrics`.
    pub fn new(
        reader: StatusReader,
        notifier: Arc<dyn Notify>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            reader,
            tracker: ReadinessTracker::new(),
            notifier,
            metrics,
        }
    }

    /// The stored health class.
    pub fn tracker(&self) -> &ReadinessTracker {
        &self.tracker
    }

    /// Query Tor, classify, update gauges, and hand off at most one event.
    pub async fn evaluate(&self) -> Evaluation {
        let (snapshot, cause) = match self.reader.get_status().await {
            Ok(snapshot) => {
                self.metrics.tor_status(&snapshot);
                let cause = (!snapshot.is_ready()).then(|| UnhealthyCause::Bootstrapping {
                    bootstrap: snapshot.bootstrap_phase,
                    circuits: snapshot.num_circuits,
                });
                (Some(snapshot), cause)
            }
            Err(err) => {
                warn!(error = %err, "tor status query failed");
                (None, Some(UnhealthyCause::Unreachable(err.to_string())))
            }
        };

        let ready = cause.is_none();
        self.metrics.tor_ready(ready);

        let transition = self.tracker.observe(ready);
        match transition {
            Transition::Changed(healthy) => info!(healthy, "tor health changed"),
            Transition::Baseline => debug!(healthy = ready, "tor health baseline"),
            Transition::Unchanged => {}
        }

        if let Some(event) = decide_event(transition, cause.as_ref()) {
            self.notifier.notify(event);
        }

        Evaluation {
            ready,
            transition,
            snapshot,
        }
    }
}
