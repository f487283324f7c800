//! Configuration store for Harbormaster
//!
//! Holds the site and pool definitions plus the global monitoring settings,
//! and persists them as a single JSON document.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Default configuration file name
pub const CONFIG_FILE: &str = "harbormaster.json";

/// Allowed check interval in seconds
pub const CHECK_INTERVAL_RANGE: RangeInclusive<u64> = 10..=300;

/// Allowed failure threshold
pub const MAX_FAILURES_RANGE: RangeInclusive<u32> = 1..=10;

const CHECK_TIMEOUT_RANGE: RangeInclusive<u64> = 1..=300;
const EXPECTED_STATUS_RANGE: RangeInclusive<u16> = 100..=599;
const RESTART_DELAY_RANGE: RangeInclusive<u64> = 0..=3600;

/// Number of rejected entries spelled out in an ingest summary
const SUMMARY_ERROR_LIMIT: usize = 5;

/// Kind of monitored target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Web endpoint
    Site,
    /// Worker group
    Pool,
}

impl TargetKind {
    /// Name used by the service manager command line
    pub fn command_noun(&self) -> &'static str {
        match self {
            TargetKind::Site => "site",
            TargetKind::Pool => "apppool",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Site => write!(f, "site"),
            TargetKind::Pool => write!(f, "pool"),
        }
    }
}

/// Shape shared by every per-target configuration entry
pub trait TargetConfig: Clone + DeserializeOwned {
    /// Whether the target is probed at all
    fn enabled(&self) -> bool;

    /// Range checks beyond what the JSON types already enforce
    fn validate(&self) -> std::result::Result<(), String>;
}

/// Site (web endpoint) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Probe URL; empty means "resolve from the live binding"
    pub url: String,

    /// Enable monitoring for this site
    pub enabled: bool,

    /// HTTP timeout in seconds
    pub check_timeout: u64,

    /// Status code that counts as healthy
    pub expected_status: u16,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            enabled: true,
            check_timeout: 10,
            expected_status: 200,
        }
    }
}

impl SiteConfig {
    /// Site config probing the given URL
    #[cfg(test)]
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Configured URL, if any
    pub fn configured_url(&self) -> Option<&str> {
        let url = self.url.trim();
        (!url.is_empty()).then_some(url)
    }
}

impl TargetConfig for SiteConfig {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self) -> std::result::Result<(), String> {
        check_range("check_timeout", self.check_timeout, &CHECK_TIMEOUT_RANGE)?;
        check_range("expected_status", self.expected_status, &EXPECTED_STATUS_RANGE)
    }
}

/// Pool (worker group) configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Enable monitoring for this pool
    pub enabled: bool,

    /// Allow automatic restarts of this pool
    pub auto_restart: bool,

    /// Seconds to wait between stop and start
    pub restart_delay: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_restart: true,
            restart_delay: 5,
        }
    }
}

impl TargetConfig for PoolConfig {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self) -> std::result::Result<(), String> {
        check_range("restart_delay", self.restart_delay, &RESTART_DELAY_RANGE)
    }
}

fn check_range<T>(field: &str, value: T, range: &RangeInclusive<T>) -> std::result::Result<(), String>
where
    T: PartialOrd + fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(format!(
            "{} = {} is outside {}..={}",
            field,
            value,
            range.start(),
            range.end()
        ))
    }
}

/// Global monitoring settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Seconds between check cycles
    pub check_interval: u64,

    /// Consecutive failures before a restart is attempted
    pub max_failures: u32,

    /// Master switch for automatic restarts
    pub global_auto_restart: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            check_interval: 60,
            max_failures: 3,
            global_auto_restart: true,
        }
    }
}

impl GlobalSettings {
    /// Reject values outside the supported ranges
    pub fn validate(&self) -> Result<()> {
        check_range("check_interval", self.check_interval, &CHECK_INTERVAL_RANGE)
            .and_then(|_| check_range("max_failures", self.max_failures, &MAX_FAILURES_RANGE))
            .map_err(Error::ConfigValidation)
    }

    /// Pull values into the supported ranges
    pub fn clamped(self) -> Self {
        Self {
            check_interval: self
                .check_interval
                .clamp(*CHECK_INTERVAL_RANGE.start(), *CHECK_INTERVAL_RANGE.end()),
            max_failures: self
                .max_failures
                .clamp(*MAX_FAILURES_RANGE.start(), *MAX_FAILURES_RANGE.end()),
            global_auto_restart: self.global_auto_restart,
        }
    }

    /// Check interval as Duration
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval)
    }
}

/// The persisted configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorConfig {
    /// Site definitions keyed by site name
    pub websites: BTreeMap<String, SiteConfig>,

    /// Pool definitions keyed by pool name
    pub app_pools: BTreeMap<String, PoolConfig>,

    /// Global settings, flattened into the top-level object
    #[serde(flatten)]
    pub globals: GlobalSettings,
}

impl MonitorConfig {
    /// Build a document from parsed JSON, isolating bad entries
    ///
    /// Unknown fields are ignored, missing ones default, out-of-range
    /// globals are clamped. Bad site or pool entries are dropped and reported.
    pub fn from_value(value: &Value) -> Result<(Self, Vec<EntryError>)> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::ConfigValidation("top-level value must be an object".into()))?;

        let mut rejected = Vec::new();
        let empty = Value::Object(Default::default());
        let mut section = |key: &str| match object.get(key) {
            Some(value) if value.is_object() => value.clone(),
            None => empty.clone(),
            Some(_) => {
                rejected.push(EntryError {
                    name: key.to_string(),
                    reason: "must be an object keyed by name".into(),
                });
                empty.clone()
            }
        };
        let websites = section("websites");
        let app_pools = section("app_pools");
        let sites = ingest::<SiteConfig>(&websites)?;
        let pools = ingest::<PoolConfig>(&app_pools)?;

        let defaults = GlobalSettings::default();
        let globals = GlobalSettings {
            check_interval: object
                .get("check_interval")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.check_interval),
            max_failures: object
                .get("max_failures")
                .and_then(Value::as_u64)
                .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
                .unwrap_or(defaults.max_failures),
            global_auto_restart: object
                .get("global_auto_restart")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.global_auto_restart),
        }
        .clamped();

        rejected.extend(sites.rejected);
        rejected.extend(pools.rejected);

        Ok((
            Self {
                websites: sites.accepted,
                app_pools: pools.accepted,
                globals,
            },
            rejected,
        ))
    }
}

/// A single configuration entry that could not be accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryError {
    /// Target name as given in the input
    pub name: String,
    /// Why the entry was rejected
    pub reason: String,
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': {}", self.name, self.reason)
    }
}

/// Outcome of validating a batch of per-target entries
#[derive(Debug, Clone)]
pub struct Ingest<T> {
    /// Entries that passed validation
    pub accepted: BTreeMap<String, T>,
    /// Entries that were skipped
    pub rejected: Vec<EntryError>,
}

impl<T> Ingest<T> {
    /// Operator-facing summary of the batch
    pub fn summary(&self, what: &str) -> String {
        let mut out = format!(
            "{} configuration: {} accepted, {} rejected",
            what,
            self.accepted.len(),
            self.rejected.len()
        );
        for err in self.rejected.iter().take(SUMMARY_ERROR_LIMIT) {
            out.push_str(&format!("\n  - {}", err));
        }
        if self.rejected.len() > SUMMARY_ERROR_LIMIT {
            out.push_str(&format!(
                "\n  ... and {} more",
                self.rejected.len() - SUMMARY_ERROR_LIMIT
            ));
        }
        out
    }
}

/// Parse bulk-update text; blank input is an empty batch
pub fn parse_batch(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Validate a JSON object of `name -> entry` one entry at a time
pub fn ingest<T: TargetConfig>(value: &Value) -> Result<Ingest<T>> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::ConfigValidation("expected an object keyed by target name".into()))?;

    let mut accepted = BTreeMap::new();
    let mut rejected = Vec::new();

    for (name, entry) in object {
        let reject = |reason: String| EntryError {
            name: name.clone(),
            reason,
        };

        if name.trim().is_empty() {
            rejected.push(reject("empty target name".into()));
            continue;
        }
        if !entry.is_object() {
            rejected.push(reject("entry must be an object".into()));
            continue;
        }

        match serde_json::from_value::<T>(entry.clone()) {
            Ok(config) => match config.validate() {
                Ok(()) => {
                    accepted.insert(name.clone(), config);
                }
                Err(reason) => rejected.push(reject(reason)),
            },
            Err(e) => rejected.push(reject(e.to_string())),
        }
    }

    Ok(Ingest { accepted, rejected })
}

/// What `ConfigStore::load` found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// File read; the listed entries were skipped
    Loaded { rejected: Vec<EntryError> },
    /// No file yet, defaults in effect
    Missing,
    /// File unreadable or malformed, defaults in effect
    Invalid(String),
}

/// Thread-safe owner of the configuration document
///
/// Readers get clones. The write side of the lock serializes writers,
/// including the save that follows every change.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<MonitorConfig>,
}

impl ConfigStore {
    /// Store with default settings, not yet loaded
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(MonitorConfig::default()),
        }
    }

    /// Create a store and load it from disk
    pub fn open(path: impl Into<PathBuf>) -> (Self, LoadOutcome) {
        let store = Self::new(path);
        let outcome = store.load();
        (store, outcome)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification time of the backing file, None while it is missing
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|meta| meta.modified()).ok()
    }

    /// Reload from disk; never fails, falls back to defaults
    pub fn load(&self) -> LoadOutcome {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.inner.write() = MonitorConfig::default();
                return LoadOutcome::Missing;
            }
            Err(e) => {
                *self.inner.write() = MonitorConfig::default();
                let err = Error::ConfigRead {
                    path: self.path.clone(),
                    source: e,
                };
                return LoadOutcome::Invalid(err.to_string());
            }
        };

        let parsed = serde_json::from_str::<Value>(&content)
            .map_err(Error::from)
            .and_then(|value| MonitorConfig::from_value(&value));

        match parsed {
            Ok((config, rejected)) => {
                *self.inner.write() = config;
                LoadOutcome::Loaded { rejected }
            }
            Err(e) => {
                *self.inner.write() = MonitorConfig::default();
                LoadOutcome::Invalid(e.to_string())
            }
        }
    }

    /// Swap the whole site map, then save
    pub fn replace_sites(&self, sites: BTreeMap<String, SiteConfig>) -> Result<()> {
        let mut doc = self.inner.write();
        doc.websites = sites;
        persist(&self.path, &doc)
    }

    /// Swap the whole pool map, then save
    pub fn replace_pools(&self, pools: BTreeMap<String, PoolConfig>) -> Result<()> {
        let mut doc = self.inner.write();
        doc.app_pools = pools;
        persist(&self.path, &doc)
    }

    /// Replace global settings after validating them, then save
    pub fn set_globals(&self, globals: GlobalSettings) -> Result<()> {
        globals.validate()?;
        let mut doc = self.inner.write();
        doc.globals = globals;
        persist(&self.path, &doc)
    }

    /// Copy of the whole document
    pub fn document(&self) -> MonitorConfig {
        self.inner.read().clone()
    }

    /// Copy of the site map
    pub fn sites(&self) -> BTreeMap<String, SiteConfig> {
        self.inner.read().websites.clone()
    }

    /// Copy of the pool map
    pub fn pools(&self) -> BTreeMap<String, PoolConfig> {
        self.inner.read().app_pools.clone()
    }

    /// Current global settings
    pub fn globals(&self) -> GlobalSettings {
        self.inner.read().globals
    }

    /// Whether a configuration entry exists for the target
    pub fn contains(&self, kind: TargetKind, name: &str) -> bool {
        let doc = self.inner.read();
        match kind {
            TargetKind::Site => doc.websites.contains_key(name),
            TargetKind::Pool => doc.app_pools.contains_key(name),
        }
    }

    /// Pool configuration, if the pool is defined
    pub fn pool(&self, name: &str) -> Option<PoolConfig> {
        self.inner.read().app_pools.get(name).cloned()
    }
}

fn persist(path: &Path, doc: &MonitorConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(doc)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let write_err = |source| Error::ConfigWrite {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, content).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)
}
