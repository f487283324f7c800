//! Point-in-time copies of monitor state for outside readers

use crate::manifest::{GlobalSettings, TargetKind};
use crate::warden::state::{EngineStatus, TargetState, WardenState};
use serde::Serialize;
use std::collections::BTreeMap;

/// Settings echoed alongside the state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotSettings {
    pub interval: u64,
    pub max_failures: u32,
    pub global_auto_restart: bool,
}

impl From<GlobalSettings> for SnapshotSettings {
    fn from(globals: GlobalSettings) -> Self {
        Self {
            interval: globals.check_interval,
            max_failures: globals.max_failures,
            global_auto_restart: globals.global_auto_restart,
        }
    }
}

/// Deep copy of the monitor state; shares nothing with the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub engine: EngineStatus,
    pub sites: BTreeMap<String, TargetState>,
    pub pools: BTreeMap<String, TargetState>,
    pub settings: SnapshotSettings,
}

impl StatusSnapshot {
    /// Copy out of the locked state
    pub fn capture(state: &WardenState, globals: GlobalSettings) -> Self {
        Self {
            engine: state.engine.clone(),
            sites: state.targets_of(TargetKind::Site),
            pools: state.targets_of(TargetKind::Pool),
            settings: globals.into(),
        }
    }

    /// Text rendering for terminals
    pub fn render(&self) -> String {
        let engine = &self.engine;
        let mut out = String::new();

        out.push_str(&format!(
            "Monitor: {}   uptime: {}   interval: {}s   max failures: {}   auto restart: {}\n",
            engine.status,
            format_duration(engine.uptime_seconds),
            self.settings.interval,
            self.settings.max_failures,
            if self.settings.global_auto_restart { "on" } else { "off" }
        ));
        out.push_str(&format!(
            "Checks: {}   failures: {}   restarts: {}\n\n",
            engine.total_checks, engine.total_failures, engine.total_restarts
        ));

        out.push_str(&format!(
            "{:<6} {:<28} {:<10} {:<6} {:<10}\n",
            "KIND", "NAME", "STATUS", "FAILS", "LAST CHECK"
        ));
        out.push_str(&format!("{}\n", "-".repeat(64)));

        let rows = self
            .sites
            .iter()
            .map(|(name, state)| (TargetKind::Site, name, state))
            .chain(
                self.pools
                    .iter()
                    .map(|(name, state)| (TargetKind::Pool, name, state)),
            );
        for (kind, name, state) in rows {
            let last = state
                .last_check
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "{:<6} {:<28} {:<10} {:<6} {:<10}\n",
                kind.to_string(),
                name,
                state.status.to_string(),
                state.fail_count,
                last
            ));
        }

        if self.sites.is_empty() && self.pools.is_empty() {
            out.push_str("(no targets configured)\n");
        }
        out
    }
}

/// Human-readable duration
pub fn format_duration(seconds: f64) -> String {
    if seconds <= 0.0 {
        "0s".to_string()
    } else if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}
