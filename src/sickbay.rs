//! Health probing and recovery for monitored targets
//!
//! Provides:
//! - Site (HTTP) and pool (service manager state) probes
//! - The restart policy applied when a target keeps failing

pub mod probe;
pub mod recovery;

pub use probe::{HttpProbe, PoolProbe, ProbeError, SiteProbe, UreqProbe};
pub use recovery::{RecoveryDecision, RemediationPolicy, RestartProfile, SkipReason};
