//! Restart policy for failing targets
//!
//! Decides from the consecutive-failure count and the global settings
//! whether a target gets restarted, and performs the stop/wait/start cycle.

use crate::controller::ProcessController;
use crate::error::{Error, Result};
use crate::manifest::{GlobalSettings, PoolConfig, TargetKind};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Per-target restart intent, derived from its configuration entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartProfile {
    /// Target-level permission to restart
    pub auto_restart: bool,
    /// Wait between stop and start
    pub delay: Duration,
}

impl RestartProfile {
    /// Profile of a site; sites have no per-target switch
    pub fn site(delay: Duration) -> Self {
        Self {
            auto_restart: true,
            delay,
        }
    }

    /// Profile of a pool
    pub fn pool(config: &PoolConfig) -> Self {
        Self {
            auto_restart: config.auto_restart,
            delay: Duration::from_secs(config.restart_delay),
        }
    }
}

/// Why no restart is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Failure count still below `max_failures`
    BelowThreshold,
    /// `global_auto_restart` is off
    GloballyDisabled,
    /// The target's own `auto_restart` is off
    TargetDisabled,
    /// The target no longer has a configuration entry
    NotConfigured,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::BelowThreshold => write!(f, "below failure threshold"),
            SkipReason::GloballyDisabled => write!(f, "automatic restart disabled globally"),
            SkipReason::TargetDisabled => write!(f, "automatic restart disabled for target"),
            SkipReason::NotConfigured => write!(f, "no configuration entry"),
        }
    }
}

/// Outcome of evaluating one failed check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Stop, wait `delay`, start
    Restart { delay: Duration },
    /// Record the failure only
    Skip(SkipReason),
}

/// Restart policy bound to a service manager
pub struct RemediationPolicy {
    controller: Arc<dyn ProcessController>,
}

impl RemediationPolicy {
    pub fn new(controller: Arc<dyn ProcessController>) -> Self {
        Self { controller }
    }

    /// Decide what to do about a failed check
    ///
    /// Evaluated on every failing check: once the threshold is reached a
    /// restart is requested each time until the counter is reset.
    pub fn evaluate(
        fail_count: u32,
        globals: &GlobalSettings,
        profile: Option<RestartProfile>,
    ) -> RecoveryDecision {
        if fail_count < globals.max_failures {
            return RecoveryDecision::Skip(SkipReason::BelowThreshold);
        }
        if !globals.global_auto_restart {
            return RecoveryDecision::Skip(SkipReason::GloballyDisabled);
        }
        match profile {
            None => RecoveryDecision::Skip(SkipReason::NotConfigured),
            Some(profile) if !profile.auto_restart => {
                RecoveryDecision::Skip(SkipReason::TargetDisabled)
            }
            Some(profile) => RecoveryDecision::Restart {
                delay: profile.delay,
            },
        }
    }

    /// Stop the target, wait, start it again
    ///
    /// Only the start result decides success; a failed stop is reported
    /// but the start is still attempted.
    pub fn execute(&self, kind: TargetKind, name: &str, delay: Duration) -> Result<()> {
        match self.controller.stop(kind, name) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(%kind, name, "stop command reported failure"),
            Err(e) => tracing::warn!(%kind, name, error = %e, "stop command failed"),
        }

        if !delay.is_zero() {
            thread::sleep(delay);
        }

        match self.controller.start(kind, name) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Remediation {
                kind,
                name: name.to_string(),
                message: "start command reported failure".to_string(),
            }),
            Err(e) => Err(Error::Remediation {
                kind,
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
