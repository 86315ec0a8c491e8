//! Cross-pass backoff and per-key single flight
//!
//! The kube-runtime work queue already runs one pass per object at a time.
//! [`InFlight`] makes the same guarantee explicit inside the process so a
//! forced requeue can never overlap a running pass.

use std::sync::Arc;
use std::time::Duration;

use authtoken_common::retry::exponential_delay;
use authtoken_common::ErrorClass;
use dashmap::{DashMap, DashSet};

/// Requeue delays per failure class
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// First delay after a transient failure
    pub transient_initial: Duration,
    /// Cap for transient failures
    pub transient_max: Duration,
    /// First delay after a permission failure
    pub permission_initial: Duration,
    /// Cap for permission failures
    pub permission_max: Duration,
    /// Fixed delay while a name conflict persists
    pub conflict: Duration,
    /// Fixed delay while the spec or profile is invalid
    pub validation: Duration,
    /// Multiplier for exponential classes
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            transient_initial: Duration::from_secs(5),
            transient_max: Duration::from_secs(300),
            permission_initial: Duration::from_secs(15),
            permission_max: Duration::from_secs(600),
            conflict: Duration::from_secs(600),
            validation: Duration::from_secs(1800),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay for the `streak`-th consecutive failure of `class`
    pub fn delay(&self, class: ErrorClass, streak: u32) -> Duration {
        match class {
            ErrorClass::Transient => exponential_delay(
                self.transient_initial,
                self.transient_max,
                self.multiplier,
                streak,
            ),
            ErrorClass::Permission => exponential_delay(
                self.permission_initial,
                self.permission_max,
                self.multiplier,
                streak,
            ),
            ErrorClass::Conflict => self.conflict,
            ErrorClass::Validation => self.validation,
        }
    }

    /// Whether requeues for this class get jitter
    pub fn jittered(class: ErrorClass) -> bool {
        matches!(class, ErrorClass::Transient | ErrorClass::Permission)
    }
}

/// Consecutive failures of the same class, per request key
#[derive(Default)]
pub struct FailureTracker {
    streaks: DashMap<String, (ErrorClass, u32)>,
}

impl FailureTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the current streak for its class
    ///
    /// A failure of a different class than the previous one starts a new streak.
    pub fn record(&self, key: &str, class: ErrorClass) -> u32 {
        let mut entry = self
            .streaks
            .entry(key.to_string())
            .or_insert((class, 0));
        if entry.0 != class {
            *entry = (class, 0);
        }
        entry.1 = entry.1.saturating_add(1);
        entry.1
    }

    /// Current streak, if the last pass for `key` failed
    pub fn streak(&self, key: &str) -> Option<(ErrorClass, u32)> {
        self.streaks.get(key).map(|e| *e)
    }

    /// Forget failures after a successful pass
    pub fn reset(&self, key: &str) {
        self.streaks.remove(key);
    }
}

/// Keys with a reconcile pass currently running
#[derive(Default)]
pub struct InFlight {
    keys: DashSet<String>,
}

impl InFlight {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`; `None` when a pass for it is already running
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<InFlightGuard> {
        if self.keys.insert(key.to_string()) {
            Some(InFlightGuard {
                owner: Arc::clone(self),
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

/// Releases the key when dropped
pub struct InFlightGuard {
    owner: Arc<InFlight>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.owner.keys.remove(&self.key);
    }
}
