//! Cluster wide build settings mirrored from the `cluster` singletons
//!
//! The controller keeps one copy of the derived settings (trusted certificate
//! authorities, `registries.conf`, `policy.json`, defaults and overrides). Workers
//! read clones of it while creating build pods, and the config worker replaces it
//! whenever one of the singletons or the referenced CA ConfigMap changes.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kiln_core::{
    cluster::{
        BuildDefaults, BuildOverrides, RegistrySources, CLUSTER_CONFIG_NAME, OPENSHIFT_CONFIG_NAMESPACE,
    },
    ClusterBuildConfig, ClusterImageConfig,
};
use kiln_runtime::{reflector::ObjectRef, Store};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::{Error, Result};

/// Work queue key of the config worker
pub const CONFIG_KEY: &str = OPENSHIFT_CONFIG_NAMESPACE;

/// ConfigMap key of the generated registries configuration
pub const REGISTRY_CONF_KEY: &str = "registries.conf";
/// ConfigMap key of the generated signature policy
pub const SIGNATURE_POLICY_KEY: &str = "policy.json";

#[derive(Clone, Debug, Default)]
struct State {
    additional_trusted_cas: BTreeMap<String, String>,
    registries_conf: String,
    signature_policy: String,
    defaults: BuildDefaults,
    overrides: BuildOverrides,
}

/// Shared, lock protected build settings
///
/// All accessors return copies so callers never hold the lock across an await.
#[derive(Debug, Default)]
pub struct ClusterConfig {
    state: Mutex<State>,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry hostname to PEM bundle
    pub fn additional_trusted_cas(&self) -> BTreeMap<String, String> {
        self.state.lock().additional_trusted_cas.clone()
    }

    pub fn set_additional_trusted_cas(&self, cas: BTreeMap<String, String>) {
        self.state.lock().additional_trusted_cas = cas;
    }

    /// Empty when the default registry settings apply
    pub fn registries_conf(&self) -> String {
        self.state.lock().registries_conf.clone()
    }

    pub fn set_registries_conf(&self, toml: String) {
        self.state.lock().registries_conf = toml;
    }

    /// Empty when images may be pulled from anywhere
    pub fn signature_policy(&self) -> String {
        self.state.lock().signature_policy.clone()
    }

    pub fn set_signature_policy(&self, json: String) {
        self.state.lock().signature_policy = json;
    }

    pub fn defaults(&self) -> BuildDefaults {
        self.state.lock().defaults.clone()
    }

    pub fn overrides(&self) -> BuildOverrides {
        self.state.lock().overrides.clone()
    }

    pub fn set_build_settings(&self, defaults: BuildDefaults, overrides: BuildOverrides) {
        let mut state = self.state.lock();
        state.defaults = defaults;
        state.overrides = overrides;
    }

    /// Re-reads both singletons and everything derived from them
    ///
    /// Every part is applied independently; failures are collected and returned
    /// together while the parts that succeeded still take effect.
    pub fn sync(
        &self,
        builds: &Store<ClusterBuildConfig>,
        images: &Store<ClusterImageConfig>,
        config_maps: &Store<ConfigMap>,
    ) -> Result<()> {
        let errors = self.read_image_config(images, config_maps);
        self.read_build_config(builds);
        match Error::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read_build_config(&self, builds: &Store<ClusterBuildConfig>) {
        match builds.get(&ObjectRef::new(CLUSTER_CONFIG_NAME)) {
            Some(config) => {
                debug!(spec = ?config.spec, "build controller config");
                self.set_build_settings(
                    config.spec.build_defaults.clone(),
                    config.spec.build_overrides.clone(),
                );
            }
            None => self.set_build_settings(BuildDefaults::default(), BuildOverrides::default()),
        }
    }

    fn read_image_config(
        &self,
        images: &Store<ClusterImageConfig>,
        config_maps: &Store<ConfigMap>,
    ) -> Vec<Error> {
        let Some(config) = images.get(&ObjectRef::new(CLUSTER_CONFIG_NAME)) else {
            self.set_additional_trusted_cas(BTreeMap::new());
            self.set_registries_conf(String::new());
            self.set_signature_policy(String::new());
            return Vec::new();
        };
        debug!(spec = ?config.spec, "image config");

        let mut errors = Vec::new();
        self.set_additional_trusted_cas(additional_trusted_cas(&config, config_maps));
        match registries_conf_toml(&config.spec.registry_sources) {
            Ok(toml) => self.set_registries_conf(toml.unwrap_or_default()),
            Err(err) => errors.push(err),
        }
        match signature_policy_json(&config.spec.registry_sources) {
            Ok(json) => self.set_signature_policy(json.unwrap_or_default()),
            Err(err) => errors.push(err),
        }
        errors
    }
}

fn additional_trusted_cas(
    config: &ClusterImageConfig,
    config_maps: &Store<ConfigMap>,
) -> BTreeMap<String, String> {
    let name = &config.spec.additional_trusted_ca.name;
    if name.is_empty() {
        debug!("additional certificate authorities for builds not specified");
        return BTreeMap::new();
    }
    match config_maps.get_namespaced(OPENSHIFT_CONFIG_NAMESPACE, name) {
        Some(cm) => {
            let data = cm.data.clone().unwrap_or_default();
            debug!(hosts = ?data.keys().collect::<Vec<_>>(), "found certificate authorities");
            data
        }
        None => {
            info!(
                configmap = %format!("{OPENSHIFT_CONFIG_NAMESPACE}/{name}"),
                "configMap with additional certificate authorities for builds not found"
            );
            BTreeMap::new()
        }
    }
}

#[derive(Serialize)]
struct TomlConfig<'a> {
    registries: Registries<'a>,
}

#[derive(Serialize)]
struct Registries<'a> {
    search: RegistryList<'a>,
    insecure: RegistryList<'a>,
}

#[derive(Serialize)]
struct RegistryList<'a> {
    registries: &'a [String],
}

/// Renders `registries.conf` for build pods
///
/// `None` unless insecure registries are configured. `docker.io` is the only search
/// registry.
pub fn registries_conf_toml(sources: &RegistrySources) -> Result<Option<String>> {
    if sources.insecure_registries.is_empty() {
        debug!("using default insecure registry settings for builds");
        return Ok(None);
    }
    let search = ["docker.io".to_owned()];
    let config = TomlConfig {
        registries: Registries {
            search: RegistryList { registries: &search },
            insecure: RegistryList {
                registries: &sources.insecure_registries,
            },
        },
    };
    let toml = toml::to_string(&config)?;
    debug!(registries_conf = %toml, "overrode insecure registry settings for builds");
    Ok(Some(toml).filter(|t| !t.is_empty()))
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
enum PolicyRequirement {
    Reject,
    InsecureAcceptAnything,
}

#[derive(Serialize)]
struct SignaturePolicy<'a> {
    default: [PolicyRequirement; 1],
    transports: BTreeMap<&'static str, &'a BTreeMap<&'a str, [PolicyRequirement; 1]>>,
}

/// Renders `policy.json` for build pods
///
/// With allowed registries everything else is rejected; with blocked registries only
/// those are rejected. `None` when neither list is set.
pub fn signature_policy_json(sources: &RegistrySources) -> Result<Option<String>> {
    let (default, listed, registries) = match (
        sources.allowed_registries.is_empty(),
        sources.blocked_registries.is_empty(),
    ) {
        (true, true) => {
            debug!("allowing builds to pull images from all registries");
            return Ok(None);
        }
        (false, false) => return Err(Error::ConflictingRegistrySources),
        (false, true) => {
            debug!(
                registries = ?sources.allowed_registries,
                "only allowing image pulls from listed registries"
            );
            (
                PolicyRequirement::Reject,
                PolicyRequirement::InsecureAcceptAnything,
                &sources.allowed_registries,
            )
        }
        (true, false) => {
            debug!(registries = ?sources.blocked_registries, "blocking image pulls from listed registries");
            (
                PolicyRequirement::InsecureAcceptAnything,
                PolicyRequirement::Reject,
                &sources.blocked_registries,
            )
        }
    };
    let scopes: BTreeMap<&str, [PolicyRequirement; 1]> =
        registries.iter().map(|r| (r.as_str(), [listed])).collect();
    // every transport a build pod pulls through
    let policy = SignaturePolicy {
        default: [default],
        transports: BTreeMap::from([("atomic", &scopes), ("docker", &scopes)]),
    };
    let json = serde_json::to_string(&policy).map_err(Error::SignaturePolicy)?;
    debug!(policy_json = %json, "generated policy.json for build pods");
    Ok(Some(json))
}
