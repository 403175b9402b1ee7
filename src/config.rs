//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::k8s::ApiGeneration;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The logging config, which uses `tracing_subscriber::EnvFilter` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,

    /// The duration in seconds for which the lock of a parent controller is held without renewal.
    #[serde(default = "Config::default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,
    /// The interval in seconds at which expired locks are reaped.
    #[serde(default = "Config::default_lease_reaper_interval_seconds")]
    pub lease_reaper_interval_seconds: u64,
    /// The maximum duration in seconds to wait for the lock of a parent controller.
    #[serde(default = "Config::default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    /// The duration in seconds to wait after a move before checking the pod's health.
    #[serde(default = "Config::default_health_check_delay_seconds")]
    pub health_check_delay_seconds: u64,
    /// The cap placed on the termination grace period of a moved pod.
    #[serde(default)]
    pub max_grace_period_seconds: i64,

    /// The name of a scheduler which does not exist, assigned to a parent controller during a move.
    #[serde(default = "Config::default_scheduler_name")]
    pub scheduler_name: String,
    /// The generation of the cluster API, parsed from a K8s version such as `1.6`.
    #[serde(default = "Config::default_k8s_version", deserialize_with = "Config::parse_k8s_version")]
    pub k8s_version: ApiGeneration,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// Create a new config instance from the given environment variables.
    pub fn from_vars<I: IntoIterator<Item = (String, String)>>(vars: I) -> Result<Self> {
        envy::from_iter(vars).context("error building config from env")
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn lease_reaper_interval(&self) -> Duration {
        Duration::from_secs(self.lease_reaper_interval_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn health_check_delay(&self) -> Duration {
        Duration::from_secs(self.health_check_delay_seconds)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_lease_ttl_seconds() -> u64 {
        60
    }

    fn default_lease_reaper_interval_seconds() -> u64 {
        5
    }

    fn default_lock_timeout_seconds() -> u64 {
        120
    }

    fn default_health_check_delay_seconds() -> u64 {
        10
    }

    fn default_scheduler_name() -> String {
        "turbo-none-exist-scheduler".into()
    }

    fn default_k8s_version() -> ApiGeneration {
        ApiGeneration::Modern
    }

    /// Parse the given K8s version into an API generation.
    fn parse_k8s_version<'de, D: Deserializer<'de>>(val: D) -> Result<ApiGeneration, D::Error> {
        let version: String = Deserialize::deserialize(val).map_err(|err| DeError::custom(format!("error parsing K8S_VERSION: {}", err)))?;
        version
            .parse()
            .map_err(|err| DeError::custom(format!("error parsing K8S_VERSION: {}", err)))
    }
}
