// ── Runtime lifecycle configuration ──
//
// Tuning for the lifecycle manager. Outer layers build a
// `LifecycleConfig` and hand it in; the core never reads config files.

use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::bus::DEFAULT_EVENT_BUFFER;

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    /// Upper bound on a single probe. A probe that runs longer counts as
    /// a transient failure.
    pub probe_timeout: Duration,
    /// Re-probe cadence while a service is connected. `None` = probe once.
    pub health_interval: Option<Duration>,
    /// Per-subscriber change event buffer.
    pub event_buffer: usize,
    /// Retry policy for transient probe failures.
    pub backoff: BackoffConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            health_interval: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            backoff: BackoffConfig::default(),
        }
    }
}
