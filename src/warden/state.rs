//! Monitor state model
//!
//! Lifecycle state machine for the monitor itself, plus the per-target
//! state table and the engine-wide counters guarded by the monitor's lock.

use crate::manifest::TargetKind;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use state_machines::state_machine;

state_machine! {
    name: WardenMachine,
    dynamic: true,  // Runtime dispatch, driven by start/stop requests
    initial: Stopped,
    states: [Stopped, Running],
    events {
        start {
            transition: { from: Stopped, to: Running }
        }
        stop {
            transition: { from: Running, to: Stopped }
        }
    }
}

/// Monitor lifecycle: stopped -> running -> stopped
pub struct Lifecycle {
    machine: DynamicWardenMachine<()>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: WardenMachine::new(()).into_dynamic(),
        }
    }

    /// Check if the monitor is in Running state
    pub fn is_running(&self) -> bool {
        self.machine.current_state() == "Running"
    }

    /// Trigger start event
    pub fn start(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(WardenMachineEvent::Start)
    }

    /// Trigger stop event
    pub fn stop(&mut self) -> Result<(), state_machines::DynamicError> {
        self.machine.handle(WardenMachineEvent::Stop)
    }
}

/// Observed status of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Not probed since the last (re)seed
    Unknown,
    /// Site answered with the expected status
    Ok,
    /// Site probe failed
    Error,
    /// Pool reported started
    Running,
    /// Pool reported anything else
    Stopped,
}

impl TargetStatus {
    /// Status recorded after a healthy probe
    pub fn healthy(kind: TargetKind) -> Self {
        match kind {
            TargetKind::Site => TargetStatus::Ok,
            TargetKind::Pool => TargetStatus::Running,
        }
    }

    /// Status recorded after a failed probe
    pub fn unhealthy(kind: TargetKind) -> Self {
        match kind {
            TargetKind::Site => TargetStatus::Error,
            TargetKind::Pool => TargetStatus::Stopped,
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Unknown => write!(f, "unknown"),
            TargetStatus::Ok => write!(f, "ok"),
            TargetStatus::Error => write!(f, "error"),
            TargetStatus::Running => write!(f, "running"),
            TargetStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// State table key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey {
    pub kind: TargetKind,
    pub name: String,
}

impl TargetKey {
    pub fn new(kind: TargetKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

/// Accounting for one target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetState {
    pub status: TargetStatus,
    /// Consecutive failed checks
    pub fail_count: u32,
    /// Time of the most recent probe (None = never)
    pub last_check: Option<DateTime<Local>>,
    pub total_checks: u64,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            status: TargetStatus::Unknown,
            fail_count: 0,
            last_check: None,
            total_checks: 0,
        }
    }
}

/// Engine status as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running,
    /// Running, but the last cycle faulted and the loop is backing off
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Running => write!(f, "running"),
            EngineState::Error => write!(f, "error"),
        }
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub status: EngineState,
    pub start_time: Option<DateTime<Local>>,
    pub last_check_time: Option<DateTime<Local>>,
    pub total_checks: u64,
    pub total_failures: u64,
    pub total_restarts: u64,
    pub uptime_seconds: f64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            status: EngineState::Stopped,
            start_time: None,
            last_check_time: None,
            total_checks: 0,
            total_failures: 0,
            total_restarts: 0,
            uptime_seconds: 0.0,
        }
    }
}

impl EngineStatus {
    /// Fresh status for a session starting at `now`
    pub fn running(now: DateTime<Local>) -> Self {
        Self {
            status: EngineState::Running,
            start_time: Some(now),
            ..Default::default()
        }
    }

    /// Recompute uptime from the start time
    pub fn refresh_uptime(&mut self, now: DateTime<Local>) {
        self.uptime_seconds = self
            .start_time
            .map(|start| (now - start).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
    }

    /// Force the stopped presentation; counters are kept
    pub fn mark_stopped(&mut self) {
        self.status = EngineState::Stopped;
        self.start_time = None;
        self.uptime_seconds = 0.0;
    }
}

/// Everything guarded by the monitor's state lock
#[derive(Debug, Default)]
pub struct WardenState {
    /// Bumped on every start and stop; stale loop threads compare against it
    pub session: u64,
    pub engine: EngineStatus,
    pub targets: BTreeMap<TargetKey, TargetState>,
}

impl WardenState {
    /// Whether `session` is the live one
    pub fn is_current(&self, session: u64) -> bool {
        self.session == session && self.engine.status != EngineState::Stopped
    }

    /// Reset every target of `kind` to unknown/0; drop names not in `names`
    pub fn reseed<'a>(&mut self, kind: TargetKind, names: impl IntoIterator<Item = &'a String>) {
        let names: BTreeSet<&String> = names.into_iter().collect();
        self.targets
            .retain(|key, _| key.kind != kind || names.contains(&key.name));
        for name in names {
            self.targets
                .insert(TargetKey::new(kind, name), TargetState::default());
        }
    }

    /// Account one probe result; returns the target's new fail count
    ///
    /// Both the per-target and the engine counters move together, so a
    /// reader holding the lock never sees one without the other. A key
    /// that is no longer seeded (its entry was removed mid-cycle) leaves
    /// the state untouched and yields None.
    pub fn record_check(
        &mut self,
        key: &TargetKey,
        healthy: bool,
        at: DateTime<Local>,
    ) -> Option<u32> {
        let target = self.targets.get_mut(key)?;
        target.total_checks += 1;
        target.last_check = Some(at);
        if healthy {
            target.status = TargetStatus::healthy(key.kind);
            target.fail_count = 0;
        } else {
            target.status = TargetStatus::unhealthy(key.kind);
            target.fail_count += 1;
        }
        let fail_count = target.fail_count;

        self.engine.total_checks += 1;
        self.engine.last_check_time = Some(at);
        if !healthy {
            self.engine.total_failures += 1;
        }
        Some(fail_count)
    }

    /// Account a successful restart
    pub fn record_restart(&mut self, key: &TargetKey) {
        self.engine.total_restarts += 1;
        if let Some(target) = self.targets.get_mut(key) {
            target.fail_count = 0;
        }
    }

    /// Targets of one kind keyed by name
    pub fn targets_of(&self, kind: TargetKind) -> BTreeMap<String, TargetState> {
        self.targets
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(key, state)| (key.name.clone(), state.clone()))
            .collect()
    }
}
