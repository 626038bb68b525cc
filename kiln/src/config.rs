//! Controller settings
use std::{str::FromStr, time::Duration};

use kiln_runtime::workqueue::ExponentialRateLimiter;
use serde::Deserialize;
use thiserror::Error;

const ENV_PREFIX: &str = "KILN_";

/// Errors from loading [`Config`] out of the environment
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A numeric variable did not parse
    #[error("invalid value {value:?} for {name}: {source}")]
    InvalidNumber {
        /// Full variable name
        name: String,
        /// The raw value
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    /// A pool size of zero would never process anything
    #[error("{0} must be greater than zero")]
    Zero(String),
}

/// Tunables of the build controller
///
/// Every field has a default, so a partial document or environment is enough.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Worker tasks per build queue and per build config queue
    pub workers: usize,
    /// Requeues of a failing key before it is dropped
    pub max_retries: u32,
    /// First retry delay in milliseconds
    pub backoff_base_ms: u64,
    /// Retry delay ceiling in seconds
    pub backoff_max_secs: u64,
    /// Reported as the event source
    pub controller_name: String,
    /// Reported as the event source instance, defaults to the controller name
    pub instance: Option<String>,
    /// Image running the docker and source strategies
    pub builder_image: String,
    /// Location of the integrated registry, handed to the pod factory
    pub internal_registry_hostname: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 5,
            max_retries: 15,
            backoff_base_ms: 5,
            backoff_max_secs: 1000,
            controller_name: "build-controller".into(),
            instance: None,
            builder_image: "quay.io/openshift/origin-docker-builder:latest".into(),
            internal_registry_hostname: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `KILN_*` environment variables
    ///
    /// Recognizes `KILN_WORKERS`, `KILN_MAX_RETRIES`, `KILN_BACKOFF_BASE_MS`,
    /// `KILN_BACKOFF_MAX_SECS`, `KILN_CONTROLLER_NAME`, `KILN_INSTANCE`,
    /// `KILN_BUILDER_IMAGE` and `KILN_INTERNAL_REGISTRY_HOSTNAME`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).filter(|v| !v.is_empty()).map(|v| (name, v))
        };
        let mut config = Config::default();
        if let Some(v) = var("WORKERS") {
            config.workers = parse(v)?;
            if config.workers == 0 {
                return Err(ConfigError::Zero(format!("{ENV_PREFIX}WORKERS")));
            }
        }
        if let Some(v) = var("MAX_RETRIES") {
            config.max_retries = parse(v)?;
        }
        if let Some(v) = var("BACKOFF_BASE_MS") {
            config.backoff_base_ms = parse(v)?;
        }
        if let Some(v) = var("BACKOFF_MAX_SECS") {
            config.backoff_max_secs = parse(v)?;
        }
        if let Some((_, v)) = var("CONTROLLER_NAME") {
            config.controller_name = v;
        }
        if let Some((_, v)) = var("INSTANCE") {
            config.instance = Some(v);
        }
        if let Some((_, v)) = var("BUILDER_IMAGE") {
            config.builder_image = v;
        }
        if let Some((_, v)) = var("INTERNAL_REGISTRY_HOSTNAME") {
            config.internal_registry_hostname = Some(v);
        }
        Ok(config)
    }

    /// The per-key retry backoff of the build queues
    pub fn rate_limiter<K>(&self) -> ExponentialRateLimiter<K> {
        ExponentialRateLimiter::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub(crate) fn reporter(&self) -> kiln_runtime::events::Reporter {
        kiln_runtime::events::Reporter {
            controller: self.controller_name.clone(),
            instance: self
                .instance
                .clone()
                .unwrap_or_else(|| self.controller_name.clone()),
        }
    }
}

fn parse<T>((name, value): (String, String)) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::InvalidNumber { name, value, source })
}
