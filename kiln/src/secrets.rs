//! Push and pull secret lookup through the build service account
use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use kiln_runtime::Store;
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// Service account builds run as unless they name one
pub const BUILDER_SERVICE_ACCOUNT: &str = "builder";

pub const DOCKERCFG_SECRET_TYPE: &str = "kubernetes.io/dockercfg";
pub const DOCKERCFG_KEY: &str = ".dockercfg";
pub const DOCKER_CONFIG_JSON_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_ALIASES: [&str; 3] = ["index.docker.io", "registry-1.docker.io", "registry.hub.docker.com"];

/// Read access to the caches holding service accounts and their secrets
#[derive(Clone)]
pub struct SecretLookup {
    pub service_accounts: Store<ServiceAccount>,
    pub secrets: Store<Secret>,
}

impl SecretLookup {
    /// Secrets listed on the service account that are present in the cache
    pub fn service_account_secrets(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<Vec<Arc<Secret>>> {
        let sa = self
            .service_accounts
            .get_namespaced(namespace, service_account)
            .ok_or_else(|| Error::ServiceAccountNotFound {
                namespace: namespace.to_owned(),
                name: service_account.to_owned(),
            })?;
        Ok(sa
            .secrets
            .iter()
            .flatten()
            .filter_map(|r| r.name.as_deref())
            .filter_map(|name| self.secrets.get_namespaced(namespace, name))
            .collect())
    }

    /// The secret a build running as `service_account` uses to push to or pull from `image`
    ///
    /// Prefers a docker credential secret for the image's registry, then falls back to
    /// the first docker credential secret of the service account.
    pub fn image_secret(
        &self,
        namespace: &str,
        service_account: &str,
        image: &str,
    ) -> Result<LocalObjectReference> {
        let secrets = self.service_account_secrets(namespace, service_account)?;
        if !image.is_empty() {
            if let Some(found) = find_docker_secret(&secrets, image) {
                return Ok(found);
            }
        }
        let fallback = secrets
            .iter()
            .find(|s| is_docker_secret(s))
            .and_then(|s| s.metadata.name.clone())
            .ok_or_else(|| Error::NoDockerSecrets {
                namespace: namespace.to_owned(),
                name: service_account.to_owned(),
            })?;
        debug!(
            %image,
            secret = %fallback,
            "no secret matches the image registry, using the service account default"
        );
        Ok(LocalObjectReference { name: fallback })
    }
}

fn is_docker_secret(secret: &Secret) -> bool {
    matches!(
        secret.type_.as_deref(),
        Some(DOCKERCFG_SECRET_TYPE | DOCKER_CONFIG_JSON_SECRET_TYPE)
    )
}

#[derive(Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, serde_json::Value>,
}

/// Registries a docker credential secret holds credentials for
fn secret_registries(secret: &Secret) -> Vec<String> {
    let data = secret.data.as_ref();
    let hosts: Option<Vec<String>> = match secret.type_.as_deref() {
        Some(DOCKERCFG_SECRET_TYPE) => data
            .and_then(|d| d.get(DOCKERCFG_KEY))
            .and_then(|raw| serde_json::from_slice::<BTreeMap<String, serde_json::Value>>(&raw.0).ok())
            .map(|cfg| cfg.into_keys().collect()),
        Some(DOCKER_CONFIG_JSON_SECRET_TYPE) => data
            .and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY))
            .and_then(|raw| serde_json::from_slice::<DockerConfigJson>(&raw.0).ok())
            .map(|cfg| cfg.auths.into_keys().collect()),
        _ => None,
    };
    hosts
        .unwrap_or_default()
        .iter()
        .map(|h| normalize_registry(h))
        .collect()
}

/// The first docker credential secret holding credentials for the registry of `image`
pub fn find_docker_secret(secrets: &[Arc<Secret>], image: &str) -> Option<LocalObjectReference> {
    let registry = image_registry(image);
    secrets
        .iter()
        .find(|s| secret_registries(s).iter().any(|r| *r == registry))
        .and_then(|s| s.metadata.name.clone())
        .map(|name| LocalObjectReference { name })
}

/// Registry host of an image pull spec, `docker.io` when none is named
pub fn image_registry(image: &str) -> String {
    match image.split_once('/') {
        Some((first, _)) if first.contains(['.', ':']) || first == "localhost" => normalize_registry(first),
        _ => DOCKER_HUB.to_owned(),
    }
}

fn normalize_registry(registry: &str) -> String {
    let host = registry
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default();
    if DOCKER_HUB_ALIASES.contains(&host) {
        DOCKER_HUB.to_owned()
    } else {
        host.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString,
    };
    use kiln_runtime::{reflector::Writer, watcher};

    fn secret(name: &str, type_: &str, key: &str, json: serde_json::Value) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("app".into()),
                ..ObjectMeta::default()
            },
            type_: Some(type_.into()),
            data: Some(BTreeMap::from([(key.to_string(), ByteString(json.to_string().into_bytes()))])),
            ..Secret::default()
        }
    }

    fn lookup(secrets: Vec<Secret>, listed: &[&str]) -> SecretLookup {
        let mut sa_w = Writer::<ServiceAccount>::default();
        sa_w.apply_watcher_event(&watcher::Event::Applied(ServiceAccount {
            metadata: ObjectMeta {
                name: Some("builder".into()),
                namespace: Some("app".into()),
                ..ObjectMeta::default()
            },
            secrets: Some(
                listed
                    .iter()
                    .map(|n| ObjectReference {
                        name: Some(n.to_string()),
                        ..ObjectReference::default()
                    })
                    .collect(),
            ),
            ..ServiceAccount::default()
        }));
        let mut secrets_w = Writer::<Secret>::default();
        secrets_w.apply_watcher_event(&watcher::Event::Restarted(secrets));
        SecretLookup {
            service_accounts: sa_w.as_reader(),
            secrets: secrets_w.as_reader(),
        }
    }

    #[test]
    fn registry_of_image() {
        assert_eq!(image_registry("ruby"), "docker.io");
        assert_eq!(image_registry("library/ruby:2.7"), "docker.io");
        assert_eq!(image_registry("quay.io/app/ruby@sha256:abc"), "quay.io");
        assert_eq!(image_registry("registry.local:5000/app/ruby"), "registry.local:5000");
        assert_eq!(normalize_registry("https://index.docker.io/v1/"), "docker.io");
    }

    #[test]
    fn matching_registry_wins() {
        let lookup = lookup(
            vec![
                secret(
                    "builder-token",
                    "kubernetes.io/service-account-token",
                    "token",
                    serde_json::json!("x"),
                ),
                secret(
                    "builder-dockercfg",
                    DOCKERCFG_SECRET_TYPE,
                    DOCKERCFG_KEY,
                    serde_json::json!({ "https://index.docker.io/v1/": {} }),
                ),
                secret(
                    "quay",
                    DOCKER_CONFIG_JSON_SECRET_TYPE,
                    DOCKER_CONFIG_JSON_KEY,
                    serde_json::json!({ "auths": { "quay.io": {} } }),
                ),
            ],
            &["builder-token", "builder-dockercfg", "quay", "deleted"],
        );
        assert_eq!(lookup.image_secret("app", "builder", "quay.io/app/ruby").unwrap().name, "quay");
        assert_eq!(lookup.image_secret("app", "builder", "ruby:2.7").unwrap().name, "builder-dockercfg");
        assert_eq!(
            lookup.image_secret("app", "builder", "registry.local/ruby").unwrap().name,
            "builder-dockercfg"
        );
        assert_eq!(lookup.image_secret("app", "builder", "").unwrap().name, "builder-dockercfg");
        assert_eq!(lookup.service_account_secrets("app", "builder").unwrap().len(), 3);
    }

    #[test]
    fn missing_service_account_or_secrets() {
        let lookup = lookup(vec![], &["builder-dockercfg"]);
        assert!(matches!(
            lookup.image_secret("app", "builder", "ruby"),
            Err(Error::NoDockerSecrets { .. })
        ));
        assert!(matches!(
            lookup.image_secret("app", "deployer", "ruby"),
            Err(Error::ServiceAccountNotFound { .. })
        ));
    }
}
