//! Store availability tracking.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Whether the limiter is currently enforcing limits against a reachable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyState {
    /// The store answers and limits are enforced.
    Normal,
    /// The store is unreachable and the failure mode applies.
    Degraded,
}

impl PolicyState {
    /// The name reported by the health endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyState::Normal => "NORMAL",
            PolicyState::Degraded => "DEGRADED",
        }
    }
}

/// Health of the rate limiter, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Whether the last store probe succeeded.
    pub store_reachable: bool,
    /// The current policy state.
    pub current_policy: PolicyState,
}

/// Tracks NORMAL and DEGRADED transitions. Each transition is logged exactly once,
/// no matter how many concurrent requests observe it.
#[derive(Debug, Default)]
pub(crate) struct PolicyMonitor {
    degraded: AtomicBool,
}

impl PolicyMonitor {
    pub fn state(&self) -> PolicyState {
        if self.degraded.load(Ordering::Acquire) {
            PolicyState::Degraded
        } else {
            PolicyState::Normal
        }
    }

    /// Records a store failure. Returns true if this moved the policy to DEGRADED.
    pub fn record_failure(&self, reason: &dyn std::fmt::Display) -> bool {
        let transitioned = !self.degraded.swap(true, Ordering::AcqRel);

        if transitioned {
            log::warn!("Rate limit store is unavailable, switching policy from NORMAL to DEGRADED: {reason}");
        }

        transitioned
    }

    /// Records a store success. Returns true if this moved the policy back to NORMAL.
    pub fn record_success(&self) -> bool {
        if !self.degraded.load(Ordering::Acquire) {
            return false;
        }

        let transitioned = self.degraded.swap(false, Ordering::AcqRel);

        if transitioned {
            log::info!("Rate limit store is reachable again, switching policy from DEGRADED to NORMAL");
        }

        transitioned
    }
}
