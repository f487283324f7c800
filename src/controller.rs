//! Service manager control
//!
//! Provides:
//! - The `ProcessController` seam the monitor uses to query and restart targets
//! - `AppCmd`, an implementation driving the IIS `appcmd` command line tool
//! - Parsers for its `list site` / `list apppool` output

use crate::error::{Error, Result};
use crate::manifest::TargetKind;
use regex::Regex;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

/// State string reported for a running target
pub const STATE_STARTED: &str = "Started";

/// State string reported for a stopped target
pub const STATE_STOPPED: &str = "Stopped";

/// State string used when nothing could be determined
pub const STATE_UNKNOWN: &str = "Unknown";

/// Ceiling for a single service manager call
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

static SITE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^SITE "([^"]+)" \(id:(\d+),bindings:([^)]*),state:(\w+)\)"#).expect("valid regex")
});

static POOL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^APPPOOL "([^"]+)" \(MgdVersion:([^,]*),MgdMode:([^,]*),state:(\w+)\)"#)
        .expect("valid regex")
});

static POOL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"APPPOOL "([^"]+)""#).expect("valid regex"));

static BINDINGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bindings:([^)]+)").expect("valid regex"));

static HTTP_BINDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"http/([^:,]*):(\d+):").expect("valid regex"));

/// One target as listed by the service manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetListing {
    /// Target name
    pub name: String,
    /// Raw state string (`Started`, `Stopped`, ...)
    pub state: String,
    /// Kind-specific detail (site id and bindings, pool runtime and mode)
    pub detail: String,
}

impl TargetListing {
    /// Whether the service manager reports the target as started
    pub fn is_started(&self) -> bool {
        self.state == STATE_STARTED
    }
}

/// Capability to query and control the underlying service manager
///
/// Every call may fail or time out; callers treat failures as
/// "unhealthy" or "restart failed", never as fatal.
pub trait ProcessController: Send + Sync {
    /// List all targets of a kind
    fn list_targets(&self, kind: TargetKind) -> Result<Vec<TargetListing>>;

    /// Current state string of one target
    fn get_state(&self, kind: TargetKind, name: &str) -> Result<String>;

    /// Stop a target; `Ok(false)` means the command ran but reported failure
    fn stop(&self, kind: TargetKind, name: &str) -> Result<bool>;

    /// Start a target; `Ok(false)` means the command ran but reported failure
    fn start(&self, kind: TargetKind, name: &str) -> Result<bool>;

    /// Probe URL derived from a site's live HTTP binding
    fn resolve_site_url(&self, name: &str) -> Result<Option<String>>;
}

/// Captured result of one command invocation
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
}

/// `ProcessController` backed by `appcmd.exe`
pub struct AppCmd {
    /// Path to the executable
    program: PathBuf,
    /// Per-call timeout
    timeout: Duration,
}

impl Default for AppCmd {
    fn default() -> Self {
        Self::new(default_program())
    }
}

impl AppCmd {
    /// Controller using the given executable
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: COMMAND_TIMEOUT,
        }
    }

    /// Override the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the tool with timeout enforcement
    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let command = format!("{} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        // Drain stdout on its own thread so a chatty listing cannot fill the pipe
        let reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).ok();
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait(); // Reap the zombie
                        return Err(Error::CommandTimeout {
                            command,
                            seconds: self.timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::CommandFailed {
                        command,
                        message: format!("Failed to wait for process: {}", e),
                    });
                }
            }
        };

        let stdout = reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        Ok(CommandOutput {
            success: status.success(),
            stdout,
        })
    }
}

impl ProcessController for AppCmd {
    fn list_targets(&self, kind: TargetKind) -> Result<Vec<TargetListing>> {
        let output = self.run(&["list", kind.command_noun()])?;
        if !output.success {
            return Err(Error::CommandFailed {
                command: format!("list {}", kind.command_noun()),
                message: output.stdout.trim().to_string(),
            });
        }
        Ok(parse_listing(kind, &output.stdout))
    }

    fn get_state(&self, kind: TargetKind, name: &str) -> Result<String> {
        let output = self.run(&["list", kind.command_noun(), name])?;
        if !output.success {
            return Err(Error::TargetNotFound {
                kind,
                name: name.to_string(),
            });
        }
        Ok(parse_state(kind, name, &output.stdout))
    }

    fn stop(&self, kind: TargetKind, name: &str) -> Result<bool> {
        Ok(self.run(&["stop", kind.command_noun(), name])?.success)
    }

    fn start(&self, kind: TargetKind, name: &str) -> Result<bool> {
        Ok(self.run(&["start", kind.command_noun(), name])?.success)
    }

    fn resolve_site_url(&self, name: &str) -> Result<Option<String>> {
        let output = self.run(&["list", "site", name])?;
        if !output.success {
            return Ok(None);
        }
        Ok(binding_url(&output.stdout))
    }
}

/// Default location of `appcmd.exe`
pub fn default_program() -> PathBuf {
    let windir = std::env::var("windir").unwrap_or_else(|_| r"C:\Windows".to_string());
    PathBuf::from(windir)
        .join("system32")
        .join("inetsrv")
        .join("appcmd.exe")
}

/// Parse `appcmd list site` / `appcmd list apppool` output
pub fn parse_listing(kind: TargetKind, output: &str) -> Vec<TargetListing> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match kind {
            TargetKind::Site => SITE_LINE.captures(line).map(|caps| TargetListing {
                name: caps[1].to_string(),
                state: caps[4].to_string(),
                detail: format!("id:{} bindings:{}", &caps[2], &caps[3]),
            }),
            TargetKind::Pool => POOL_LINE
                .captures(line)
                .map(|caps| TargetListing {
                    name: caps[1].to_string(),
                    state: caps[4].to_string(),
                    detail: format!("{} {}", &caps[2], &caps[3]),
                })
                .or_else(|| {
                    // Unusual formatting: keep the name, state unknown
                    POOL_NAME.captures(line).map(|caps| TargetListing {
                        name: caps[1].to_string(),
                        state: STATE_UNKNOWN.to_string(),
                        detail: String::new(),
                    })
                }),
        })
        .collect()
}

/// Extract the state of one target from a `list <kind> <name>` output
pub fn parse_state(kind: TargetKind, name: &str, output: &str) -> String {
    if let Some(entry) = parse_listing(kind, output)
        .into_iter()
        .find(|entry| entry.name == name && entry.state != STATE_UNKNOWN)
    {
        return entry.state;
    }

    if output.contains(STATE_STARTED) {
        STATE_STARTED.to_string()
    } else if output.contains(STATE_STOPPED) {
        STATE_STOPPED.to_string()
    } else {
        STATE_UNKNOWN.to_string()
    }
}

/// First HTTP binding of a site listing as a URL
pub fn binding_url(output: &str) -> Option<String> {
    let bindings = BINDINGS.captures(output)?;
    let http = HTTP_BINDING.captures(&bindings[1])?;

    let ip = &http[1];
    let host = if ip.is_empty() || ip == "*" { "localhost" } else { ip };
    Some(format!("http://{}:{}", host, &http[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITES: &str = r#"
SITE "Default Web Site" (id:1,bindings:http/*:80:,state:Started)
SITE "Shop" (id:2,bindings:https/*:443:,http/10.0.0.5:8080:shop.local,state:Stopped)

garbage line
"#;

    const POOLS: &str = r#"
APPPOOL "DefaultAppPool" (MgdVersion:v4.0,MgdMode:Integrated,state:Started)
APPPOOL "ShopPool" (MgdVersion:,MgdMode:Classic,state:Stopped)
APPPOOL "Odd" (something else entirely)
"#;

    #[test]
    fn test_parse_site_listing() {
        let sites = parse_listing(TargetKind::Site, SITES);
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].name, "Default Web Site");
        assert!(sites[0].is_started());
        assert_eq!(sites[1].name, "Shop");
        assert_eq!(sites[1].state, STATE_STOPPED);
        assert!(sites[1].detail.starts_with("id:2"));
    }

    #[test]
    fn test_parse_pool_listing_with_fallback() {
        let pools = parse_listing(TargetKind::Pool, POOLS);
        assert_eq!(pools.len(), 3);
        assert!(pools[0].is_started());
        assert_eq!(pools[1].state, STATE_STOPPED);
        assert_eq!(pools[2].name, "Odd");
        assert_eq!(pools[2].state, STATE_UNKNOWN);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state(TargetKind::Pool, "ShopPool", POOLS), STATE_STOPPED);
        assert_eq!(
            parse_state(TargetKind::Pool, "DefaultAppPool", POOLS),
            STATE_STARTED
        );
        assert_eq!(parse_state(TargetKind::Pool, "x", "nothing useful"), STATE_UNKNOWN);
    }

    #[test]
    fn test_binding_url() {
        let lines: Vec<_> = SITES.trim().lines().collect();
        assert_eq!(binding_url(lines[0]), Some("http://localhost:80".to_string()));
        assert_eq!(binding_url(lines[1]), Some("http://10.0.0.5:8080".to_string()));
        assert_eq!(
            binding_url(r#"SITE "Tls" (id:3,bindings:https/*:443:,state:Started)"#),
            None
        );
    }

    #[test]
    fn test_missing_program_is_command_failure() {
        let ctl = AppCmd::new("/nonexistent/harbormaster-appcmd");
        let err = ctl.list_targets(TargetKind::Site).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(ctl.stop(TargetKind::Pool, "ShopPool").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_timeout() {
        let ctl = AppCmd::new("sleep").with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = ctl.run(&["5"]).unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_is_reported() {
        assert!(AppCmd::new("true").run(&[]).unwrap().success);
        assert!(!AppCmd::new("false").run(&[]).unwrap().success);
    }
}
