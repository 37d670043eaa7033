//! Controller loop settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

/// When a draining node is terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateWhen {
    /// All workloads rescheduled or grace elapsed, whichever comes first.
    #[default]
    FirstOf,
    /// Always wait out the full grace period.
    GraceElapsed,
}

/// `[controller]` section as written in `capgrid.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_observe_interval")]
    pub observe_interval: String,
    #[serde(default = "default_consolidation_interval")]
    pub consolidation_interval: String,
    #[serde(default = "default_call_timeout")]
    pub provision_timeout: String,
    #[serde(default = "default_call_timeout")]
    pub terminate_timeout: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,
    #[serde(default)]
    pub terminate_when: TerminateWhen,
    #[serde(default = "default_drain_poll_interval")]
    pub drain_poll_interval: String,
    #[serde(default = "default_prune_after")]
    pub prune_after: String,
    /// Simulated provisioner: new nodes join immediately.
    #[serde(default = "default_true")]
    pub auto_ready: bool,
}

fn default_listen() -> String {
    "127.0.0.1:7480".to_string()
}
fn default_state_path() -> PathBuf {
    PathBuf::from("capgrid.redb")
}
fn default_observe_interval() -> String {
    "15s".to_string()
}
fn default_consolidation_interval() -> String {
    "5m".to_string()
}
fn default_call_timeout() -> String {
    "30s".to_string()
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base() -> String {
    "500ms".to_string()
}
fn default_backoff_max() -> String {
    "10s".to_string()
}
fn default_drain_poll_interval() -> String {
    "5s".to_string()
}
fn default_prune_after() -> String {
    "1h".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_path: default_state_path(),
            observe_interval: default_observe_interval(),
            consolidation_interval: default_consolidation_interval(),
            provision_timeout: default_call_timeout(),
            terminate_timeout: default_call_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            terminate_when: TerminateWhen::default(),
            drain_poll_interval: default_drain_poll_interval(),
            prune_after: default_prune_after(),
            auto_ready: true,
        }
    }
}

/// Typed controller settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub listen: String,
    pub state_path: PathBuf,
    pub observe_interval: Duration,
    pub consolidation_interval: Duration,
    pub provision_timeout: Duration,
    pub terminate_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub terminate_when: TerminateWhen,
    pub drain_poll_interval: Duration,
    pub prune_after: Duration,
    pub auto_ready: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_path: default_state_path(),
            observe_interval: Duration::from_secs(15),
            consolidation_interval: Duration::from_secs(300),
            provision_timeout: Duration::from_secs(30),
            terminate_timeout: Duration::from_secs(30),
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            terminate_when: TerminateWhen::FirstOf,
            drain_poll_interval: Duration::from_secs(5),
            prune_after: Duration::from_secs(3600),
            auto_ready: true,
        }
    }
}

impl ControllerSection {
    /// Convert to typed settings, pushing a message for every bad field.
    pub(crate) fn compile(&self, errors: &mut Vec<String>) -> ControllerSettings {
        let defaults = ControllerSettings::default();
        let mut duration = |field: &str, raw: &str, fallback: Duration| match parse_duration(raw) {
            Some(d) if !d.is_zero() => d,
            _ => {
                errors.push(format!("controller.{field}: invalid duration {raw:?}"));
                fallback
            }
        };

        let settings = ControllerSettings {
            listen: self.listen.clone(),
            state_path: self.state_path.clone(),
            observe_interval: duration(
                "observe_interval",
                &self.observe_interval,
                defaults.observe_interval,
            ),
            consolidation_interval: duration(
                "consolidation_interval",
                &self.consolidation_interval,
                defaults.consolidation_interval,
            ),
            provision_timeout: duration(
                "provision_timeout",
                &self.provision_timeout,
                defaults.provision_timeout,
            ),
            terminate_timeout: duration(
                "terminate_timeout",
                &self.terminate_timeout,
                defaults.terminate_timeout,
            ),
            max_attempts: self.max_attempts,
            backoff_base: duration("backoff_base", &self.backoff_base, defaults.backoff_base),
            backoff_max: duration("backoff_max", &self.backoff_max, defaults.backoff_max),
            terminate_when: self.terminate_when,
            drain_poll_interval: duration(
                "drain_poll_interval",
                &self.drain_poll_interval,
                defaults.drain_poll_interval,
            ),
            prune_after: duration("prune_after", &self.prune_after, defaults.prune_after),
            auto_ready: self.auto_ready,
        };

        if settings.max_attempts == 0 {
            errors.push("controller.max_attempts must be at least 1".to_string());
        }
        if settings.backoff_base > settings.backoff_max {
            errors.push("controller.backoff_base exceeds backoff_max".to_string());
        }
        if settings.listen.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "controller.listen: invalid socket address {:?}",
                settings.listen
            ));
        }
        settings
    }
}
