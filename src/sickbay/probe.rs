//! Health probes for sites and pools
//!
//! Provides:
//! - `HttpProbe`, the HTTP client seam, and `UreqProbe` implementing it
//! - `SiteProbe`: HTTP GET against the site URL, healthy on the expected status
//! - `PoolProbe`: service manager state query, healthy when `Started`

use crate::controller::{ProcessController, STATE_STARTED};
use crate::error::Error;
use crate::manifest::{SiteConfig, TargetKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use ureq::tls::TlsConfig;

/// Why a probe did not report healthy
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedStatus { expected: String, actual: String },

    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Minimal HTTP client capability
pub trait HttpProbe: Send + Sync {
    /// Issue a GET and return the response status code
    ///
    /// Non-2xx statuses are values, not errors. Certificate validation is
    /// relaxed so self-signed internal endpoints can be probed.
    fn get(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError>;
}

/// `HttpProbe` backed by ureq
#[derive(Debug, Default, Clone, Copy)]
pub struct UreqProbe;

impl HttpProbe for UreqProbe {
    fn get(&self, url: &str, timeout: Duration) -> Result<u16, ProbeError> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .tls_config(TlsConfig::builder().disable_verification(true).build())
            .build()
            .into();

        match agent.get(url).call() {
            Ok(response) => Ok(response.status().as_u16()),
            Err(ureq::Error::StatusCode(code)) => Ok(code),
            Err(ureq::Error::Timeout(_)) => Err(ProbeError::Timeout(timeout)),
            Err(e) => Err(ProbeError::Connection(e.to_string())),
        }
    }
}

/// Probe for web endpoints
pub struct SiteProbe {
    http: Arc<dyn HttpProbe>,
    controller: Arc<dyn ProcessController>,
}

impl SiteProbe {
    pub fn new(http: Arc<dyn HttpProbe>, controller: Arc<dyn ProcessController>) -> Self {
        Self { http, controller }
    }

    /// URL to probe: configured, else the site's live binding
    ///
    /// There is no blind `http://localhost` default; an unresolvable site
    /// is a lookup failure.
    pub fn resolve_url(&self, name: &str, config: &SiteConfig) -> Result<String, ProbeError> {
        if let Some(url) = config.configured_url() {
            return Ok(url.to_string());
        }
        match self.controller.resolve_site_url(name) {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(ProbeError::Lookup(format!(
                "site '{}' has no URL configured and no HTTP binding",
                name
            ))),
            Err(e) => Err(ProbeError::Lookup(e.to_string())),
        }
    }

    /// One health check; `Ok(())` means healthy
    pub fn check(&self, name: &str, config: &SiteConfig) -> Result<(), ProbeError> {
        let url = self.resolve_url(name, config)?;
        let timeout = Duration::from_secs(config.check_timeout);
        let status = self.http.get(&url, timeout)?;

        if status == config.expected_status {
            Ok(())
        } else {
            Err(ProbeError::UnexpectedStatus {
                expected: config.expected_status.to_string(),
                actual: status.to_string(),
            })
        }
    }
}

/// Probe for worker pools
pub struct PoolProbe {
    controller: Arc<dyn ProcessController>,
}

impl PoolProbe {
    pub fn new(controller: Arc<dyn ProcessController>) -> Self {
        Self { controller }
    }

    /// One health check; `Ok(())` means the pool reports `Started`
    pub fn check(&self, name: &str) -> Result<(), ProbeError> {
        let state = self
            .controller
            .get_state(TargetKind::Pool, name)
            .map_err(|e| match e {
                Error::TargetNotFound { .. } => ProbeError::Lookup(e.to_string()),
                Error::CommandTimeout { seconds, .. } => {
                    ProbeError::Timeout(Duration::from_secs(seconds))
                }
                other => ProbeError::Connection(other.to_string()),
            })?;

        if state == STATE_STARTED {
            Ok(())
        } else {
            Err(ProbeError::UnexpectedStatus {
                expected: STATE_STARTED.to_string(),
                actual: state,
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::{FakeController, ScriptedHttp};
    use super::*;

    fn site_probe(http: &Arc<ScriptedHttp>, ctl: &Arc<FakeController>) -> SiteProbe {
        SiteProbe::new(http.clone(), ctl.clone())
    }

    #[test]
    fn test_site_healthy_on_expected_status() {
        let http = Arc::new(ScriptedHttp::default());
        let ctl = Arc::new(FakeController::new());
        http.script("http://shop.local", vec![Ok(200), Ok(503)]);

        let probe = site_probe(&http, &ctl);
        let config = SiteConfig::with_url("http://shop.local");
        assert_eq!(probe.check("shop", &config), Ok(()));
        assert!(matches!(
            probe.check("shop", &config),
            Err(ProbeError::UnexpectedStatus { .. })
        ));
    }

    #[test]
    fn test_site_custom_expected_status() {
        let http = Arc::new(ScriptedHttp::default());
        let ctl = Arc::new(FakeController::new());
        http.script("http://api.local/ping", vec![Ok(204)]);

        let config = SiteConfig {
            expected_status: 204,
            ..SiteConfig::with_url("http://api.local/ping")
        };
        assert_eq!(site_probe(&http, &ctl).check("api", &config), Ok(()));
    }

    #[test]
    fn test_site_url_from_binding() {
        let http = Arc::new(ScriptedHttp::default());
        let ctl = Arc::new(FakeController::new());
        ctl.bindings
            .lock()
            .insert("shop".to_string(), "http://localhost:8080".to_string());
        http.script("http://localhost:8080", vec![Ok(200)]);

        let probe = site_probe(&http, &ctl);
        assert_eq!(probe.check("shop", &SiteConfig::default()), Ok(()));
        assert_eq!(http.calls.lock().as_slice(), ["http://localhost:8080"]);
    }

    #[test]
    fn test_site_without_url_or_binding_is_lookup_error() {
        let http = Arc::new(ScriptedHttp::default());
        let ctl = Arc::new(FakeController::new());

        let probe = site_probe(&http, &ctl);
        let err = probe.check("ghost", &SiteConfig::default()).unwrap_err();
        assert!(matches!(err, ProbeError::Lookup(_)));
        assert!(http.calls.lock().is_empty());
    }

    #[test]
    fn test_site_network_errors_propagate_as_probe_errors() {
        let http = Arc::new(ScriptedHttp::default());
        let ctl = Arc::new(FakeController::new());
        http.script(
            "http://slow.local",
            vec![Err(ProbeError::Timeout(Duration::from_secs(10)))],
        );

        let err = site_probe(&http, &ctl)
            .check("slow", &SiteConfig::with_url("http://slow.local"))
            .unwrap_err();
        assert_eq!(err, ProbeError::Timeout(Duration::from_secs(10)));
    }

    #[test]
    fn test_pool_states() {
        let ctl = Arc::new(FakeController::new());
        ctl.set_state("up", "Started");
        ctl.set_state("down", "Stopped");
        ctl.set_state("odd", "Unknown");

        let probe = PoolProbe::new(ctl.clone());
        assert_eq!(probe.check("up"), Ok(()));
        assert!(matches!(
            probe.check("down"),
            Err(ProbeError::UnexpectedStatus { .. })
        ));
        assert!(probe.check("odd").is_err());
        assert!(matches!(probe.check("missing"), Err(ProbeError::Lookup(_))));
    }

    #[test]
    fn test_ureq_connection_refused_is_error() {
        // Port 9 (discard) on loopback is closed on any sane test host
        let result = UreqProbe.get("http://127.0.0.1:9/", Duration::from_millis(500));
        assert!(result.is_err());
    }
}
