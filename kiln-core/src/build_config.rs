//! The `BuildConfig` resource that groups builds
use std::{fmt, str::FromStr};

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::ObjectMeta, NamespaceResourceScope};
use serde::{Deserialize, Serialize};

/// A template that produces numbered builds sharing a run policy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BuildConfigSpec,
    #[serde(default)]
    pub status: BuildConfigStatus,
}

impl_resource!(
    BuildConfig,
    group = "build.openshift.io",
    version = "v1",
    kind = "BuildConfig",
    plural = "buildconfigs",
    scope = NamespaceResourceScope
);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicy>,
    /// Number of complete builds kept when pruning, unlimited when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_builds_history_limit: Option<i32>,
    /// Number of failed, errored and cancelled builds kept when pruning, unlimited when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_builds_history_limit: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfigStatus {
    /// Number of the most recently created build
    #[serde(default)]
    pub last_version: i64,
}

/// How builds of one build config may run relative to each other
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunPolicy {
    /// Builds start as soon as no serial build of the group is active
    Parallel,
    /// One build at a time, in build number order
    #[default]
    Serial,
    /// One build at a time, older queued builds are cancelled
    SerialLatestOnly,
}

impl RunPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPolicy::Parallel => "Parallel",
            RunPolicy::Serial => "Serial",
            RunPolicy::SerialLatestOnly => "SerialLatestOnly",
        }
    }

    /// Serial and SerialLatestOnly both forbid concurrency within a group
    pub fn is_serial(self) -> bool {
        self != RunPolicy::Parallel
    }
}

impl fmt::Display for RunPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a run policy label holds an unknown value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run policy {0:?}")]
pub struct ParseRunPolicyError(String);

impl FromStr for RunPolicy {
    type Err = ParseRunPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Parallel" => Ok(RunPolicy::Parallel),
            "Serial" => Ok(RunPolicy::Serial),
            "SerialLatestOnly" => Ok(RunPolicy::SerialLatestOnly),
            other => Err(ParseRunPolicyError(other.to_owned())),
        }
    }
}
