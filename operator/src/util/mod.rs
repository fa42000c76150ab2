use std::time::Duration;

pub mod patch;

#[cfg(feature = "metrics")]
pub mod metrics;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Default interval for requeuing a Domain whose reconciliation otherwise
/// converged (no pod work pending).
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

pub use domain_common::MANAGER_NAME;
