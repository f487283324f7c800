//! The Warden - site and pool supervisor
//!
//! Runs one background monitor thread that probes every enabled target per
//! cycle, keeps consecutive-failure accounting, and restarts targets that
//! reach the failure threshold:
//! - Restarts are re-attempted on every failing cycle until one succeeds
//!   or the target recovers on its own
//! - Probe and restart I/O runs outside the state lock; accounting blocks
//!   are atomic under it
//! - The logbook is never written while the state lock is held

pub mod snapshot;
pub mod state;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde_json::Value;

use crate::controller::ProcessController;
use crate::error::{Error, Result};
use crate::logbook::Logbook;
use crate::manifest::{
    self, ConfigStore, GlobalSettings, Ingest, LoadOutcome, PoolConfig, SiteConfig, TargetConfig,
    TargetKind,
};
use crate::sickbay::{
    HttpProbe, PoolProbe, ProbeError, RecoveryDecision, RemediationPolicy, RestartProfile,
    SiteProbe, SkipReason,
};

pub use snapshot::StatusSnapshot;

use state::{EngineState, Lifecycle, TargetKey, WardenState};

/// Tunables that are not part of the persisted configuration
#[derive(Debug, Clone, Copy)]
pub struct WardenOptions {
    /// How long `stop()` waits for the monitor thread
    pub join_timeout: Duration,
    /// Pause after a faulted cycle
    pub fault_backoff: Duration,
    /// How long a snapshot read waits for the state lock
    pub snapshot_timeout: Duration,
    /// Wait between stop and start when restarting a site
    pub site_restart_delay: Duration,
}

impl Default for WardenOptions {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            fault_backoff: Duration::from_secs(5),
            snapshot_timeout: Duration::from_millis(100),
            site_restart_delay: Duration::from_secs(5),
        }
    }
}

/// Result of a start/stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The monitor changed state
    Changed(&'static str),
    /// Nothing to do; the monitor was already in the requested state
    Unchanged(&'static str),
}

impl Transition {
    pub fn message(&self) -> &'static str {
        match self {
            Transition::Changed(msg) | Transition::Unchanged(msg) => msg,
        }
    }

    #[cfg(test)]
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Changed(_))
    }
}

/// Everything the monitor thread needs, shared with the foreground handle
struct Shared {
    store: Arc<ConfigStore>,
    logbook: Arc<Logbook>,
    controller: Arc<dyn ProcessController>,
    site_probe: SiteProbe,
    pool_probe: PoolProbe,
    policy: RemediationPolicy,
    options: WardenOptions,
    state: Mutex<WardenState>,
}

/// Handles of a running monitor thread
struct Control {
    lifecycle: Lifecycle,
    stop_tx: Option<Sender<()>>,
    done_rx: Option<Receiver<()>>,
    handle: Option<JoinHandle<()>>,
}

/// The monitoring engine
pub struct Warden {
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl Warden {
    /// Create a Warden over the given collaborators
    ///
    /// State entries are seeded for every configured target.
    pub fn new(
        store: Arc<ConfigStore>,
        logbook: Arc<Logbook>,
        controller: Arc<dyn ProcessController>,
        http: Arc<dyn HttpProbe>,
        options: WardenOptions,
    ) -> Self {
        let shared = Shared {
            site_probe: SiteProbe::new(http, Arc::clone(&controller)),
            pool_probe: PoolProbe::new(Arc::clone(&controller)),
            policy: RemediationPolicy::new(Arc::clone(&controller)),
            store,
            logbook,
            controller,
            options,
            state: Mutex::new(WardenState::default()),
        };
        shared.reseed_all();

        Self {
            shared: Arc::new(shared),
            control: Mutex::new(Control {
                lifecycle: Lifecycle::new(),
                stop_tx: None,
                done_rx: None,
                handle: None,
            }),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.shared.store
    }

    pub fn logbook(&self) -> &Logbook {
        &self.shared.logbook
    }

    pub fn controller(&self) -> &dyn ProcessController {
        self.shared.controller.as_ref()
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.control.lock().lifecycle.is_running()
    }

    /// Start the monitor thread
    ///
    /// A second call while running changes nothing, counters included.
    pub fn start(&self) -> Result<Transition> {
        let mut control = self.control.lock();
        if control.lifecycle.is_running() {
            return Ok(Transition::Unchanged("monitor is already running"));
        }

        let session = self.shared.begin_session();

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new()
            .name("harbormaster-monitor".to_string())
            .spawn(move || {
                shared.run(session, &stop_rx);
                let _ = done_tx.send(());
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.end_session();
                self.shared
                    .logbook
                    .error(&format!("monitor thread could not be spawned: {}", e));
                return Err(Error::Spawn(e.to_string()));
            }
        };

        control
            .lifecycle
            .start()
            .map_err(|e| Error::Lifecycle(format!("{:?}", e)))?;
        control.stop_tx = Some(stop_tx);
        control.done_rx = Some(done_rx);
        control.handle = Some(handle);

        self.shared.logbook.info("monitor started");
        Ok(Transition::Changed("monitor started"))
    }

    /// Stop the monitor thread
    ///
    /// Waits at most `join_timeout` for the thread; the stopped status is
    /// applied either way, and a thread that is still busy can no longer
    /// touch the state.
    pub fn stop(&self) -> Result<Transition> {
        let mut control = self.control.lock();
        if !control.lifecycle.is_running() {
            return Ok(Transition::Unchanged("monitor is not running"));
        }

        self.shared.logbook.info("stopping monitor...");

        // Disconnecting the stop channel wakes the interval wait
        drop(control.stop_tx.take());

        let finished = match control.done_rx.take() {
            Some(done) => !matches!(
                done.recv_timeout(self.shared.options.join_timeout),
                Err(RecvTimeoutError::Timeout)
            ),
            None => true,
        };

        self.shared.end_session();

        if let Some(handle) = control.handle.take() {
            if finished {
                self.shared.reap(handle);
            } else {
                self.shared.logbook.warn(&format!(
                    "monitor thread still busy after {:?}; detached",
                    self.shared.options.join_timeout
                ));
            }
        }

        control
            .lifecycle
            .stop()
            .map_err(|e| Error::Lifecycle(format!("{:?}", e)))?;

        self.shared.logbook.info("monitor stopped");
        Ok(Transition::Changed("monitor stopped"))
    }

    /// Copy of the current state, or None if the lock is contended
    ///
    /// None means "no update available", not an error.
    pub fn get_snapshot(&self) -> Option<StatusSnapshot> {
        let globals = self.shared.store.globals();
        let state = self
            .shared
            .state
            .try_lock_for(self.shared.options.snapshot_timeout)?;
        Some(StatusSnapshot::capture(&state, globals))
    }

    /// Run exactly one check cycle in the foreground
    pub fn run_once(&self) -> Result<StatusSnapshot> {
        let control = self.control.lock();
        if control.lifecycle.is_running() {
            return Err(Error::Busy(
                "stop the monitor before running a manual cycle".into(),
            ));
        }

        let session = self.shared.begin_session();
        // Keep the sender alive so the cycle never sees a stop request
        let (_stop_tx, stop_rx) = channel::bounded::<()>(1);
        self.shared.check_cycle(session, &stop_rx);
        self.shared.finish_cycle(session);

        let snapshot = {
            let state = self.shared.state.lock();
            StatusSnapshot::capture(&state, self.shared.store.globals())
        };
        self.shared.end_session();
        drop(control);
        Ok(snapshot)
    }

    /// Swap the site map, save it, and reseed site state
    pub fn replace_sites(&self, sites: BTreeMap<String, SiteConfig>) -> Result<()> {
        let names: Vec<String> = sites.keys().cloned().collect();
        let saved = self.shared.store.replace_sites(sites);
        self.shared.state.lock().reseed(TargetKind::Site, &names);
        self.shared.log_saved("site", names.len(), &saved);
        saved
    }

    /// Swap the pool map, save it, and reseed pool state
    pub fn replace_pools(&self, pools: BTreeMap<String, PoolConfig>) -> Result<()> {
        let names: Vec<String> = pools.keys().cloned().collect();
        let saved = self.shared.store.replace_pools(pools);
        self.shared.state.lock().reseed(TargetKind::Pool, &names);
        self.shared.log_saved("pool", names.len(), &saved);
        saved
    }

    /// Validate a bulk site update entry by entry and apply the valid part
    ///
    /// Only a batch that is not an object at all is an error; a failed save
    /// is logged.
    pub fn import_sites(&self, batch: &Value) -> Result<Ingest<SiteConfig>> {
        let ingest = manifest::ingest::<SiteConfig>(batch)?;
        let _ = self.replace_sites(ingest.accepted.clone());
        self.shared.log_ingest(&ingest.summary("Site"), !ingest.rejected.is_empty());
        Ok(ingest)
    }

    /// Validate a bulk pool update entry by entry and apply the valid part
    pub fn import_pools(&self, batch: &Value) -> Result<Ingest<PoolConfig>> {
        let ingest = manifest::ingest::<PoolConfig>(batch)?;
        let _ = self.replace_pools(ingest.accepted.clone());
        self.shared.log_ingest(&ingest.summary("Pool"), !ingest.rejected.is_empty());
        Ok(ingest)
    }

    /// Validate and save global settings; they apply from the next cycle
    pub fn set_globals(&self, globals: GlobalSettings) -> Result<()> {
        self.shared.store.set_globals(globals)?;
        self.shared.logbook.info(&format!(
            "global settings saved: interval {}s, max failures {}, auto restart {}",
            globals.check_interval, globals.max_failures, globals.global_auto_restart
        ));
        Ok(())
    }

    /// Re-read the configuration file and reseed every target
    ///
    /// Picks up edits made by other processes; a running loop sees the new
    /// maps from its next cycle.
    pub fn reload(&self) -> LoadOutcome {
        let outcome = self.shared.store.load();
        self.shared.reseed_all();
        self.shared.log_load(&outcome);
        outcome
    }

    /// Log what an initial configuration load found
    pub fn log_load(&self, outcome: &LoadOutcome) {
        self.shared.log_load(outcome);
    }
}

impl Drop for Warden {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl Shared {
    /// Open a new session: fresh counters, every target unknown/0
    fn begin_session(&self) -> u64 {
        let sites: Vec<String> = self.store.sites().into_keys().collect();
        let pools: Vec<String> = self.store.pools().into_keys().collect();

        let mut state = self.state.lock();
        state.session += 1;
        state.engine = state::EngineStatus::running(Local::now());
        state.reseed(TargetKind::Site, &sites);
        state.reseed(TargetKind::Pool, &pools);
        state.session
    }

    /// Close the session; any thread still holding it is locked out
    fn end_session(&self) {
        let mut state = self.state.lock();
        state.session += 1;
        state.engine.mark_stopped();
    }

    fn reseed_all(&self) {
        let sites: Vec<String> = self.store.sites().into_keys().collect();
        let pools: Vec<String> = self.store.pools().into_keys().collect();

        let mut state = self.state.lock();
        state.reseed(TargetKind::Site, &sites);
        state.reseed(TargetKind::Pool, &pools);
    }

    /// Monitor thread body
    fn run(&self, session: u64, stop_rx: &Receiver<()>) {
        loop {
            if stop_requested(stop_rx) || !self.state.lock().is_current(session) {
                break;
            }

            let cycle = panic::catch_unwind(AssertUnwindSafe(|| {
                self.check_cycle(session, stop_rx);
                self.finish_cycle(session);
            }));

            let wait = match cycle {
                Ok(()) => self.store.globals().interval(),
                Err(payload) => {
                    {
                        let mut state = self.state.lock();
                        if state.is_current(session) {
                            state.engine.status = EngineState::Error;
                        }
                    }
                    self.logbook.error(&format!(
                        "monitor cycle fault: {}; retrying in {:?}",
                        panic_message(payload.as_ref()),
                        self.options.fault_backoff
                    ));
                    self.options.fault_backoff
                }
            };

            match stop_rx.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
    }

    /// Probe every enabled target once: sites first, then pools
    fn check_cycle(&self, session: u64, stop_rx: &Receiver<()>) {
        let globals = self.store.globals();

        for (name, config) in self.store.sites() {
            if !config.enabled() {
                continue;
            }
            if stop_requested(stop_rx) {
                return;
            }
            self.isolated(TargetKind::Site, &name, || {
                let verdict = self.site_probe.check(&name, &config);
                let profile = self.restart_profile(TargetKind::Site, &name);
                self.account(session, TargetKind::Site, &name, verdict, &globals, profile);
            });
        }

        for (name, config) in self.store.pools() {
            if !config.enabled() {
                continue;
            }
            if stop_requested(stop_rx) {
                return;
            }
            self.isolated(TargetKind::Pool, &name, || {
                let verdict = self.pool_probe.check(&name);
                let profile = self.restart_profile(TargetKind::Pool, &name);
                self.account(session, TargetKind::Pool, &name, verdict, &globals, profile);
            });
        }
    }

    /// Close a cycle: refresh uptime, clear a previous fault
    fn finish_cycle(&self, session: u64) {
        let mut state = self.state.lock();
        if !state.is_current(session) {
            return;
        }
        state.engine.refresh_uptime(Local::now());
        if state.engine.status == EngineState::Error {
            state.engine.status = EngineState::Running;
        }
    }

    /// Run one target's work; a panic is logged and does not escape
    fn isolated(&self, kind: TargetKind, name: &str, work: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            self.logbook.error(&format!(
                "checking {} '{}' failed unexpectedly: {}",
                kind,
                name,
                panic_message(payload.as_ref())
            ));
        }
    }

    fn restart_profile(&self, kind: TargetKind, name: &str) -> Option<RestartProfile> {
        match kind {
            TargetKind::Site => self
                .store
                .contains(TargetKind::Site, name)
                .then(|| RestartProfile::site(self.options.site_restart_delay)),
            TargetKind::Pool => self.store.pool(name).map(|pool| RestartProfile::pool(&pool)),
        }
    }

    /// Join a finished monitor thread, logging a panic that escaped it
    fn reap(&self, handle: JoinHandle<()>) {
        if let Err(payload) = handle.join() {
            self.logbook.error(&format!(
                "monitor thread panicked: {}",
                panic_message(payload.as_ref())
            ));
        }
    }

    /// Record a probe verdict and, on failure, apply the restart policy
    fn account(
        &self,
        session: u64,
        kind: TargetKind,
        name: &str,
        verdict: std::result::Result<(), ProbeError>,
        globals: &GlobalSettings,
        profile: Option<RestartProfile>,
    ) {
        let key = TargetKey::new(kind, name);

        let (fail_count, decision) = {
            let mut state = self.state.lock();
            if !state.is_current(session) {
                return;
            }
            // Entry removed by a config change while the probe was running
            let Some(fail_count) = state.record_check(&key, verdict.is_ok(), Local::now()) else {
                return;
            };
            let decision = verdict
                .is_err()
                .then(|| RemediationPolicy::evaluate(fail_count, globals, profile));
            (fail_count, decision)
        };

        let (Err(err), Some(decision)) = (verdict, decision) else {
            return;
        };

        self.logbook.warn(&format!(
            "{} '{}' check failed ({}/{}): {}",
            kind, name, fail_count, globals.max_failures, err
        ));

        match decision {
            RecoveryDecision::Restart { delay } => {
                self.logbook.warn(&format!(
                    "{} '{}' failed {} consecutive checks, restarting...",
                    kind, name, fail_count
                ));
                match self.policy.execute(kind, name, delay) {
                    Ok(()) => {
                        let counted = {
                            let mut state = self.state.lock();
                            let current = state.is_current(session);
                            if current {
                                state.record_restart(&key);
                            }
                            current
                        };
                        if counted {
                            self.logbook
                                .info(&format!("{} '{}' restarted successfully", kind, name));
                        }
                    }
                    Err(e) => self.logbook.error(&e.to_string()),
                }
            }
            RecoveryDecision::Skip(SkipReason::BelowThreshold) => {}
            RecoveryDecision::Skip(reason) => self.logbook.info(&format!(
                "{} '{}' reached the failure threshold; not restarting: {}",
                kind, name, reason
            )),
        }
    }

    fn log_saved(&self, what: &str, count: usize, saved: &Result<()>) {
        match saved {
            Ok(()) => self
                .logbook
                .info(&format!("{} configuration saved ({} entries)", what, count)),
            Err(e) => self
                .logbook
                .error(&format!("{} configuration not saved: {}", what, e)),
        }
    }

    fn log_ingest(&self, summary: &str, had_errors: bool) {
        if had_errors {
            self.logbook.warn(summary);
        } else {
            self.logbook.info(summary);
        }
    }

    fn log_load(&self, outcome: &LoadOutcome) {
        let path = self.store.path().display();
        match outcome {
            LoadOutcome::Loaded { rejected } => {
                self.logbook.info(&format!("configuration loaded from {}", path));
                for err in rejected {
                    self.logbook
                        .warn(&format!("configuration entry skipped: {}", err));
                }
            }
            LoadOutcome::Missing => self
                .logbook
                .info(&format!("no configuration at {}; using defaults", path)),
            LoadOutcome::Invalid(reason) => self.logbook.error(&format!(
                "configuration at {} unusable ({}); using defaults",
                path, reason
            )),
        }
    }
}

/// Whether the stop channel has been signalled or disconnected
fn stop_requested(stop_rx: &Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::state::{TargetState, TargetStatus};
    use super::*;
    use crate::manifest::CONFIG_FILE;
    use crate::sickbay::probe::fakes::{FakeController, ScriptedHttp};
    use serde_json::json;
    use std::time::Instant;
    use tempfile::TempDir;

    const SHOP: &str = "http://shop.local/health";

    struct Rig {
        _dir: TempDir,
        http: Arc<ScriptedHttp>,
        ctl: Arc<FakeController>,
        warden: Warden,
    }

    fn quick() -> WardenOptions {
        WardenOptions {
            join_timeout: Duration::from_millis(100),
            fault_backoff: Duration::from_millis(10),
            snapshot_timeout: Duration::from_millis(20),
            site_restart_delay: Duration::ZERO,
        }
    }

    fn rig(
        sites: &[(&str, &str)],
        pools: &[(&str, PoolConfig)],
        globals: GlobalSettings,
        options: WardenOptions,
    ) -> Rig {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join(CONFIG_FILE));
        store
            .replace_sites(
                sites
                    .iter()
                    .map(|(name, url)| (name.to_string(), SiteConfig::with_url(url)))
                    .collect(),
            )
            .unwrap();
        store
            .replace_pools(
                pools
                    .iter()
                    .map(|(name, config)| (name.to_string(), config.clone()))
                    .collect(),
            )
            .unwrap();
        store.set_globals(globals).unwrap();

        let http = Arc::new(ScriptedHttp::default());
        let ctl = Arc::new(FakeController::new());
        let warden = Warden::new(
            Arc::new(store),
            Arc::new(Logbook::memory(200)),
            ctl.clone(),
            http.clone(),
            options,
        );
        Rig {
            _dir: dir,
            http,
            ctl,
            warden,
        }
    }

    fn threshold(max_failures: u32, auto: bool) -> GlobalSettings {
        GlobalSettings {
            check_interval: 10,
            max_failures,
            global_auto_restart: auto,
        }
    }

    /// Open a session and run `cycles` checks in the foreground
    fn cycles(warden: &Warden, cycles: usize) -> Vec<StatusSnapshot> {
        let session = warden.shared.begin_session();
        let (_tx, rx) = channel::bounded::<()>(1);
        (0..cycles)
            .map(|_| {
                warden.shared.check_cycle(session, &rx);
                warden.shared.finish_cycle(session);
                warden.get_snapshot().unwrap()
            })
            .collect()
    }

    fn logged(warden: &Warden, needle: &str) -> bool {
        warden
            .logbook()
            .recent(200)
            .iter()
            .any(|line| line.contains(needle))
    }

    #[test]
    fn test_failing_site_is_restarted_at_threshold() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        r.http
            .script(SHOP, vec![Ok(200), Ok(503), Ok(503), Ok(503), Ok(200), Ok(200)]);

        let snaps = cycles(&r.warden, 6);
        let trace: Vec<u32> = snaps.iter().map(|s| s.sites["shop"].fail_count).collect();
        assert_eq!(trace, [0, 1, 2, 0, 0, 0]);

        let last = snaps.last().unwrap();
        assert_eq!(last.engine.total_checks, 6);
        assert_eq!(last.engine.total_failures, 3);
        assert_eq!(last.engine.total_restarts, 1);
        assert_eq!(last.sites["shop"].status, TargetStatus::Ok);
        assert_eq!(r.ctl.restarts(), ["start site shop"]);
        assert!(logged(&r.warden, "site 'shop' restarted successfully"));
    }

    #[test]
    fn test_failed_restart_is_retried_every_cycle() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        r.http.script(SHOP, vec![Ok(500)]);
        *r.ctl.start_ok.lock() = false;

        let snaps = cycles(&r.warden, 5);
        let trace: Vec<u32> = snaps.iter().map(|s| s.sites["shop"].fail_count).collect();
        assert_eq!(trace, [1, 2, 3, 4, 5]);
        assert_eq!(r.ctl.restarts().len(), 3);
        assert_eq!(snaps[4].engine.total_restarts, 0);
        assert!(logged(&r.warden, "Restart of site 'shop' failed"));
    }

    #[test]
    fn test_stopped_pool_is_started() {
        let r = rig(
            &[],
            &[("ShopPool", PoolConfig { restart_delay: 0, ..Default::default() })],
            threshold(1, true),
            quick(),
        );
        r.ctl.set_state("ShopPool", "Stopped");

        let snaps = cycles(&r.warden, 2);
        assert_eq!(snaps[0].pools["ShopPool"].status, TargetStatus::Stopped);
        assert_eq!(snaps[0].pools["ShopPool"].fail_count, 0);
        assert_eq!(snaps[0].engine.total_restarts, 1);
        assert_eq!(snaps[1].pools["ShopPool"].status, TargetStatus::Running);
        assert_eq!(
            r.ctl.actions.lock().as_slice(),
            ["stop pool ShopPool", "start pool ShopPool"]
        );
    }

    #[test]
    fn test_restart_gates() {
        let r = rig(&[("shop", SHOP)], &[], threshold(1, false), quick());
        r.http.script(SHOP, vec![Ok(500)]);
        let snaps = cycles(&r.warden, 3);
        assert_eq!(snaps[2].sites["shop"].fail_count, 3);
        assert!(r.ctl.actions.lock().is_empty());
        assert!(logged(&r.warden, "automatic restart disabled globally"));

        let manual = PoolConfig {
            auto_restart: false,
            ..Default::default()
        };
        let r = rig(&[], &[("ShopPool", manual)], threshold(1, true), quick());
        r.ctl.set_state("ShopPool", "Stopped");
        cycles(&r.warden, 2);
        assert!(r.ctl.actions.lock().is_empty());
        assert!(logged(&r.warden, "automatic restart disabled for target"));
    }

    #[test]
    fn test_disabled_targets_are_not_probed() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        let mut sites = r.warden.store().sites();
        sites.get_mut("shop").unwrap().enabled = false;
        r.warden.replace_sites(sites).unwrap();

        let snaps = cycles(&r.warden, 2);
        assert!(r.http.calls.lock().is_empty());
        assert_eq!(snaps[1].sites["shop"].status, TargetStatus::Unknown);
        assert_eq!(snaps[1].engine.total_checks, 0);
    }

    #[test]
    fn test_start_twice_is_a_no_op() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        r.http.script(SHOP, vec![Ok(200)]);

        assert!(r.warden.start().unwrap().changed());
        assert_eq!(
            r.warden.start().unwrap(),
            Transition::Unchanged("monitor is already running")
        );
        assert!(r.warden.is_running());
        let started = r.warden.logbook().recent(200);
        assert_eq!(started.iter().filter(|l| l.ends_with("monitor started")).count(), 1);

        assert!(r.warden.stop().unwrap().changed());
        assert_eq!(
            r.warden.stop().unwrap(),
            Transition::Unchanged("monitor is not running")
        );

        let snap = r.warden.get_snapshot().unwrap();
        assert_eq!(snap.engine.status, EngineState::Stopped);
        assert_eq!(snap.engine.uptime_seconds, 0.0);
        assert!(snap.engine.start_time.is_none());
    }

    #[test]
    fn test_stop_does_not_wait_for_a_blocked_probe() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        r.http.script(SHOP, vec![Ok(500)]);
        *r.http.delay.lock() = Some(Duration::from_millis(800));

        r.warden.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        let begun = Instant::now();
        r.warden.stop().unwrap();
        assert!(begun.elapsed() < Duration::from_millis(600));
        assert!(!r.warden.is_running());

        // The detached probe finishes later; its result must not land
        thread::sleep(Duration::from_millis(1000));
        let snap = r.warden.get_snapshot().unwrap();
        assert_eq!(snap.engine.status, EngineState::Stopped);
        assert_eq!(snap.engine.total_checks, 0);
        assert_eq!(snap.sites["shop"].status, TargetStatus::Unknown);
        assert!(logged(&r.warden, "detached"));
    }

    #[test]
    fn test_restart_resets_session_counters() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        r.http.script(SHOP, vec![Ok(500)]);
        cycles(&r.warden, 2);

        r.warden.start().unwrap();
        r.warden.stop().unwrap();

        let snap = r.warden.run_once().unwrap();
        assert_eq!(snap.engine.total_checks, 1);
        assert_eq!(snap.sites["shop"].fail_count, 1);
    }

    #[test]
    fn test_snapshot_gives_up_when_lock_is_held() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        let guard = r.warden.shared.state.lock();
        assert!(r.warden.get_snapshot().is_none());
        drop(guard);
        assert!(r.warden.get_snapshot().is_some());
    }

    #[test]
    fn test_concurrent_snapshots_are_consistent() {
        let r = rig(
            &[("a", "http://a.local"), ("b", "http://b.local")],
            &[("P", PoolConfig { restart_delay: 0, ..Default::default() })],
            threshold(10, true),
            quick(),
        );
        r.http.script("http://a.local", vec![Ok(200)]);
        r.http.script("http://b.local", vec![Ok(500)]);
        r.ctl.set_state("P", "Started");

        let session = r.warden.shared.begin_session();
        let worker = {
            let shared = Arc::clone(&r.warden.shared);
            thread::spawn(move || {
                let (_tx, rx) = channel::bounded::<()>(1);
                for _ in 0..50 {
                    shared.check_cycle(session, &rx);
                }
            })
        };

        for _ in 0..200 {
            if let Some(snap) = r.warden.get_snapshot() {
                let per_target: u64 = snap
                    .sites
                    .values()
                    .chain(snap.pools.values())
                    .map(|t| t.total_checks)
                    .sum();
                assert_eq!(snap.engine.total_checks, per_target);
                assert!(snap.engine.total_failures <= snap.engine.total_checks);
            }
        }
        worker.join().unwrap();
    }

    #[test]
    fn test_replace_reseeds_only_that_kind() {
        let r = rig(
            &[("shop", SHOP)],
            &[("ShopPool", PoolConfig::default())],
            threshold(5, true),
            quick(),
        );
        r.http.script(SHOP, vec![Ok(500)]);
        r.ctl.set_state("ShopPool", "Stopped");
        cycles(&r.warden, 1);

        let mut sites = BTreeMap::new();
        sites.insert("shop".to_string(), SiteConfig::with_url(SHOP));
        sites.insert("blog".to_string(), SiteConfig::with_url("http://blog.local"));
        r.warden.replace_sites(sites).unwrap();

        let snap = r.warden.get_snapshot().unwrap();
        assert_eq!(snap.sites.len(), 2);
        assert_eq!(snap.sites["shop"], TargetState::default());
        assert_eq!(snap.sites["blog"].status, TargetStatus::Unknown);
        assert_eq!(snap.pools["ShopPool"].fail_count, 1);

        r.warden.replace_sites(BTreeMap::new()).unwrap();
        assert!(r.warden.get_snapshot().unwrap().sites.is_empty());
    }

    #[test]
    fn test_panicking_target_does_not_stop_the_cycle() {
        let r = rig(
            &[("shop", SHOP)],
            &[("ShopPool", PoolConfig::default())],
            threshold(1, true),
            quick(),
        );
        r.http.script(SHOP, vec![Ok(500)]);
        r.ctl.set_state("ShopPool", "Started");
        *r.ctl.panic_on_stop.lock() = true;

        let snaps = cycles(&r.warden, 2);
        assert_eq!(snaps[1].pools["ShopPool"].total_checks, 2);
        assert_eq!(snaps[1].pools["ShopPool"].status, TargetStatus::Running);
        assert_eq!(snaps[1].engine.status, EngineState::Running);
        assert!(logged(&r.warden, "checking site 'shop' failed unexpectedly"));
        assert!(logged(&r.warden, "[ERROR]"));
    }

    #[test]
    fn test_monitor_thread_runs_cycles() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        r.http.script(SHOP, vec![Ok(200)]);

        r.warden.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut checked = false;
        while Instant::now() < deadline {
            if let Some(snap) = r.warden.get_snapshot() {
                if snap.sites["shop"].total_checks >= 1 {
                    assert_eq!(snap.sites["shop"].status, TargetStatus::Ok);
                    assert_eq!(snap.engine.status, EngineState::Running);
                    checked = true;
                    break;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        r.warden.stop().unwrap();
        assert!(checked);
        assert!(logged(&r.warden, "monitor started"));
        assert!(logged(&r.warden, "monitor stopped"));
    }

    #[test]
    fn test_import_applies_the_valid_part() {
        let r = rig(&[("old", SHOP)], &[], threshold(3, true), quick());
        let batch = json!({
            "shop": { "url": SHOP },
            "broken": { "expected_status": 1000 }
        });

        let ingest = r.warden.import_sites(&batch).unwrap();
        assert_eq!(ingest.accepted.len(), 1);
        assert_eq!(ingest.rejected.len(), 1);

        let sites = r.warden.store().sites();
        assert_eq!(sites.keys().collect::<Vec<_>>(), ["shop"]);
        assert!(logged(&r.warden, "Site configuration: 1 accepted, 1 rejected"));
        assert!(r.warden.import_pools(&json!("nope")).is_err());
    }

    #[test]
    fn test_run_once_refused_while_running() {
        let r = rig(&[], &[], threshold(3, true), quick());
        r.warden.start().unwrap();
        assert!(matches!(r.warden.run_once(), Err(Error::Busy(_))));
        r.warden.stop().unwrap();

        let snap = r.warden.run_once().unwrap();
        assert_eq!(snap.engine.total_checks, 0);
    }

    #[test]
    fn test_panicked_monitor_thread_is_logged() {
        let r = rig(&[], &[], threshold(3, true), quick());
        let handle = thread::spawn(|| panic!("cycle bookkeeping broke"));
        r.warden.shared.reap(handle);
        assert!(logged(&r.warden, "[ERROR] monitor thread panicked: cycle bookkeeping broke"));
    }

    #[test]
    fn test_site_removed_during_a_probe_leaves_no_state() {
        let r = rig(&[("shop", SHOP)], &[], threshold(3, true), quick());
        r.http.script(SHOP, vec![Ok(500)]);
        *r.http.delay.lock() = Some(Duration::from_millis(300));

        r.warden.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        r.warden.replace_sites(BTreeMap::new()).unwrap();
        thread::sleep(Duration::from_millis(400));

        let snap = r.warden.get_snapshot().unwrap();
        assert!(snap.sites.is_empty());
        assert_eq!(snap.engine.total_checks, 0);
        assert_eq!(snap.engine.total_failures, 0);
        r.warden.stop().unwrap();
    }

    #[test]
    fn test_reload_picks_up_changes_from_another_store() {
        let r = rig(&[], &[], threshold(3, true), quick());
        assert!(r.warden.run_once().unwrap().sites.is_empty());

        let (other, _) = ConfigStore::open(r.warden.store().path());
        other
            .replace_sites(BTreeMap::from([("shop".to_string(), SiteConfig::with_url(SHOP))]))
            .unwrap();
        assert!(r.warden.run_once().unwrap().sites.is_empty());

        let outcome = r.warden.reload();
        assert!(matches!(outcome, LoadOutcome::Loaded { ref rejected } if rejected.is_empty()));
        let snap = r.warden.run_once().unwrap();
        assert_eq!(snap.sites.keys().collect::<Vec<_>>(), ["shop"]);
        assert_eq!(snap.settings.max_failures, 3);
    }
}
