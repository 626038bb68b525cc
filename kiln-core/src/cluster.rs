//! Cluster scoped configuration singletons read by the controller
//!
//! Both are named [`CLUSTER_CONFIG_NAME`] and live in the `config.openshift.io` group.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{EnvVar, Toleration},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ClusterResourceScope,
};
use serde::{Deserialize, Serialize};

/// Name of every cluster configuration singleton
pub const CLUSTER_CONFIG_NAME: &str = "cluster";

/// Namespace holding ConfigMaps referenced from the singletons
pub const OPENSHIFT_CONFIG_NAMESPACE: &str = "openshift-config";

/// Cluster wide build defaults and overrides
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterBuildConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterBuildConfigSpec,
}

impl_resource!(
    ClusterBuildConfig,
    group = "config.openshift.io",
    version = "v1",
    kind = "Build",
    plural = "builds",
    scope = ClusterResourceScope
);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBuildConfigSpec {
    #[serde(default)]
    pub build_defaults: BuildDefaults,
    #[serde(default)]
    pub build_overrides: BuildOverrides,
}

/// Values applied to build pods unless the build sets them itself
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_proxy: Option<ProxySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Values forced onto every build pod
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOverrides {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

/// Cluster wide image registry policy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterImageConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterImageConfigSpec,
}

impl_resource!(
    ClusterImageConfig,
    group = "config.openshift.io",
    version = "v1",
    kind = "Image",
    plural = "images",
    scope = ClusterResourceScope
);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterImageConfigSpec {
    /// ConfigMap in `openshift-config` whose entries are registry hostnames mapped to PEM bundles
    #[serde(default, rename = "additionalTrustedCA")]
    pub additional_trusted_ca: ConfigMapNameReference,
    #[serde(default)]
    pub registry_sources: RegistrySources,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMapNameReference {
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insecure_registries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_registries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_registries: Vec<String>,
}
