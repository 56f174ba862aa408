use std::time::Duration;

use serde::Deserialize;

/// Runtime tunables, read from `CONVEYOR_`-prefixed environment variables.
///
/// Every knob is optional; accessor methods supply the defaults.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub receive_timeout_secs: Option<u64>,
    pub stop_grace_millis: Option<u64>,
    pub kill_grace_secs: Option<u64>,
    pub startup_backoff_cap_secs: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("CONVEYOR_").from_env::<Self>()?)
    }

    /// Long-poll timeout for each blocking receive in the worker loop.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs.unwrap_or(20))
    }

    /// How long a reaper waits for a cancelled worker task before escalating.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_millis.unwrap_or(500))
    }

    /// How long after escalation before the worker task is aborted outright.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs.unwrap_or(3))
    }

    /// Ceiling for the jittered sleep applied before a retried service start.
    pub fn startup_backoff_cap(&self) -> Duration {
        Duration::from_secs(self.startup_backoff_cap_secs.unwrap_or(60))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receive_timeout_secs: None,
            stop_grace_millis: None,
            kill_grace_secs: None,
            startup_backoff_cap_secs: None,
        }
    }
}
