use std::time::Duration;

use capgrid_config::ControllerSettings;
use capgrid_disruption::DrainConfig;
use capgrid_reconciler::ExecutorConfig;

/// Settings handed to each component at construction.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub observe_interval: Duration,
    pub consolidation_interval: Duration,
    /// Terminated node records older than this are deleted.
    pub prune_after: Duration,
    pub executor: ExecutorConfig,
    pub drain: DrainConfig,
}

impl ControllerConfig {
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self {
            observe_interval: settings.observe_interval,
            consolidation_interval: settings.consolidation_interval,
            prune_after: settings.prune_after,
            executor: ExecutorConfig {
                call_timeout: settings.provision_timeout,
                max_attempts: settings.max_attempts,
                backoff_base: settings.backoff_base,
                backoff_max: settings.backoff_max,
                mark_ready: settings.auto_ready,
            },
            drain: DrainConfig::from(settings),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_settings(&ControllerSettings::default())
    }
}
