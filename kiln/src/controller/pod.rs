use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ConfigMap, EnvVar, LocalObjectReference, Pod},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kiln_core::{
    naming::{build_ca_config_map_name, build_system_config_map_name},
    update::BuildUpdate,
    Build, BuildPhase, ObjectMeta, Resource, ResourceExt, StatusReason,
};
use kiln_runtime::events::NewEvent;
use tracing::{debug, error, info, warn};

use super::BuildController;
use crate::{
    cluster_config::{REGISTRY_CONF_KEY, SIGNATURE_POLICY_KEY},
    secrets::BUILDER_SERVICE_ACCOUNT,
    strategy::{
        apply_defaults, apply_overrides, is_owned_by, StrategyError, CUSTOM_BUILD_BASE_IMAGE_ENV,
        SERVICE_CA_KEY,
    },
    Error, Result,
};

/// Where the registry service CA is published
const SERVICE_CA_NAMESPACE: &str = "openshift-controller-manager";
const SERVICE_CA_CONFIG_MAP: &str = "openshift-service-ca";

impl BuildController {
    /// Resolves everything the build pod needs and creates it with its ConfigMaps
    ///
    /// On success `update` moves the build to `Pending`.
    pub(super) async fn create_build_pod(&self, build: &Build, update: &mut BuildUpdate) -> Result<()> {
        let mut build = build.clone();

        if let Err(err) = self.resolve_image_references(&mut build, update).await {
            if err.is_not_found() {
                debug!(%err, "waiting for image streams");
                return Ok(());
            }
            return Err(err);
        }

        if let Err(err) = self.resolve_secrets(&mut build) {
            update.set_reason(StatusReason::CannotRetrieveServiceAccount);
            update.set_message("Unable to look up the service account secrets for this build.");
            return Err(err);
        }

        if let Some(custom) = build.spec.strategy.custom_strategy.as_mut() {
            let image = custom.from.name.clone().unwrap_or_default();
            set_env(&mut custom.env, CUSTOM_BUILD_BASE_IMAGE_ENV, image);
        }

        let pod = match self.create_pod_spec(&mut build) {
            Ok(pod) => pod,
            Err(source) => {
                update.set_reason(StatusReason::CannotCreateBuildPodSpec);
                update.set_message("Failed to create pod spec.");
                if source.is_fatal() {
                    return Err(Error::PodSpec {
                        build: build.key(),
                        source,
                    });
                }
                error!(err = %source, "failed to create build pod spec");
                return Ok(());
            }
        };

        let namespace = build.namespace().unwrap_or_default();
        let pod_name = pod.name_any();
        debug!(pod = %pod_name, "creating build pod");
        match self.clients.pods.create(&namespace, &pod).await {
            Ok(created) => {
                info!(pod = %pod_name, "created build pod");
                self.create_build_ca_config_map(&build, &created, update).await?;
                self.create_build_system_config_map(&build, &created, update).await?;
            }
            Err(err) if err.is_already_exists() => {
                let note = format!("Pod already exists: {namespace}/{pod_name}");
                self.record(&build, NewEvent::warning("FailedCreate", note)).await;
                let existing = self.clients.pods.get(&namespace, &pod_name).await?;
                if !is_owned_by(&existing, &build) {
                    *update = BuildUpdate::transition(
                        BuildPhase::Error,
                        StatusReason::BuildPodExists,
                        "The pod for this build already exists and is older than the build.",
                    );
                    return Ok(());
                }
                debug!(pod = %pod_name, "adopting existing build pod");
                if !self
                    .find_owned_config_map(&existing, &namespace, &build_ca_config_map_name(&build))
                    .await?
                {
                    self.create_build_ca_config_map(&build, &existing, update).await?;
                }
                if !self
                    .find_owned_config_map(&existing, &namespace, &build_system_config_map_name(&build))
                    .await?
                {
                    self.create_build_system_config_map(&build, &existing, update).await?;
                }
            }
            Err(err) => {
                let note = format!("Error creating build pod: {err}");
                self.record(&build, NewEvent::warning("FailedCreate", note)).await;
                update.set_reason(StatusReason::CannotCreateBuildPod);
                update.set_message("Failed creating build pod.");
                return Err(Error::CreatePod(err));
            }
        }

        *update = BuildUpdate::phase(BuildPhase::Pending);
        if let Some(secret) = build.spec.output.push_secret.clone() {
            update.set_push_secret(secret);
        }
        update.set_pod_name_annotation(pod_name);
        if let Some(to) = build.spec.output.to.as_ref().and_then(|to| to.name.clone()) {
            update.set_output_ref(to);
        }
        Ok(())
    }

    /// Fills in push and pull secrets the build does not name itself
    fn resolve_secrets(&self, build: &mut Build) -> Result<()> {
        if build.spec.output.push_secret.is_none() {
            let output = build
                .spec
                .output
                .to
                .as_ref()
                .and_then(|to| to.name.clone())
                .filter(|name| !name.is_empty());
            if let Some(output) = output {
                build.spec.output.push_secret = Some(self.image_secret(build, &output)?);
            }
        }

        if build.strategy_pull_secret_mut().is_some_and(|s| s.is_none()) {
            let image = build
                .strategy_from()
                .and_then(|from| from.name.clone())
                .unwrap_or_default();
            let secret = self.image_secret(build, &image)?;
            if let Some(slot) = build.strategy_pull_secret_mut() {
                *slot = Some(secret);
            }
        }

        for i in 0..build.spec.source.images.len() {
            if build.spec.source.images[i].pull_secret.is_some() {
                continue;
            }
            let image = build.spec.source.images[i].from.name.clone().unwrap_or_default();
            let secret = self.image_secret(build, &image)?;
            build.spec.source.images[i].pull_secret = Some(secret);
        }
        Ok(())
    }

    fn image_secret(&self, build: &Build, image: &str) -> Result<LocalObjectReference> {
        let namespace = build.namespace().unwrap_or_default();
        let service_account = build
            .spec
            .service_account
            .as_deref()
            .filter(|sa| !sa.is_empty())
            .unwrap_or(BUILDER_SERVICE_ACCOUNT);
        self.secrets.image_secret(&namespace, service_account, image)
    }

    fn create_pod_spec(&self, build: &mut Build) -> std::result::Result<Pod, StrategyError> {
        if let Some(to) = build.spec.output.to.as_ref().and_then(|to| to.name.clone()) {
            build.status.output_docker_image_reference = Some(to);
        }
        build.status.reason = None;
        build.status.message = None;

        let additional_cas = self.cluster_config.additional_trusted_cas();
        let mut pod = self.pod_factory.create_build_pod(
            build,
            &additional_cas,
            self.config.internal_registry_hostname.as_deref(),
        )?;
        apply_defaults(&mut pod, &self.cluster_config.defaults());
        apply_overrides(&mut pod, &self.cluster_config.overrides());
        Ok(pod)
    }

    /// Whether the ConfigMap exists, failing when it belongs to someone else
    async fn find_owned_config_map(&self, owner: &Pod, namespace: &str, name: &str) -> Result<bool> {
        let Some(config_map) = self.clients.config_maps.get_opt(namespace, name).await? else {
            return Ok(false);
        };
        let expected = pod_owner_ref(owner);
        if config_map.owner_references().iter().any(|r| same_owner(r, &expected)) {
            Ok(true)
        } else {
            Err(Error::ConfigMapNotOwned {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                pod: owner.name_any(),
            })
        }
    }

    async fn create_build_ca_config_map(
        &self,
        build: &Build,
        pod: &Pod,
        update: &mut BuildUpdate,
    ) -> Result<()> {
        let mut data = self.cluster_config.additional_trusted_cas();
        match self
            .stores
            .config_maps
            .get_namespaced(SERVICE_CA_NAMESPACE, SERVICE_CA_CONFIG_MAP)
            .and_then(|cm| cm.data.as_ref()?.get(SERVICE_CA_KEY).cloned())
        {
            Some(service_ca) => {
                data.insert(SERVICE_CA_KEY.to_owned(), service_ca);
            }
            None => warn!(
                "registry service CA {SERVICE_CA_NAMESPACE}/{SERVICE_CA_CONFIG_MAP} not found, \
                 builds may fail to trust the integrated registry"
            ),
        }
        let config_map = owned_config_map(build_ca_config_map_name(build), pod, data);
        if let Err(err) = self.create_config_map(build, &config_map).await {
            let note = format!("Error creating build certificate authority configMap: {err}");
            self.record(build, NewEvent::warning("FailedCreate", note)).await;
            update.set_reason(StatusReason::CannotCreateCAConfigMap);
            update.set_message("Failed creating build certificate authority configMap.");
            return Err(Error::CreateCaConfigMap(err));
        }
        Ok(())
    }

    async fn create_build_system_config_map(
        &self,
        build: &Build,
        pod: &Pod,
        update: &mut BuildUpdate,
    ) -> Result<()> {
        let mut data = BTreeMap::new();
        let registries_conf = self.cluster_config.registries_conf();
        if !registries_conf.is_empty() {
            data.insert(REGISTRY_CONF_KEY.to_owned(), registries_conf);
        }
        let signature_policy = self.cluster_config.signature_policy();
        if !signature_policy.is_empty() {
            data.insert(SIGNATURE_POLICY_KEY.to_owned(), signature_policy);
        }
        let config_map = owned_config_map(build_system_config_map_name(build), pod, data);
        if let Err(err) = self.create_config_map(build, &config_map).await {
            let note = format!("Error creating build system config configMap: {err}");
            self.record(build, NewEvent::warning("FailedCreate", note)).await;
            update.set_reason(StatusReason::CannotCreateBuildSysConfigMap);
            update.set_message("Failed creating build system config configMap.");
            return Err(Error::CreateSystemConfigMap(err));
        }
        Ok(())
    }

    async fn create_config_map(&self, build: &Build, config_map: &ConfigMap) -> kiln_client::Result<()> {
        let namespace = build.namespace().unwrap_or_default();
        let created = self.clients.config_maps.create(&namespace, config_map).await?;
        debug!(config_map = %created.name_any(), "created build configMap");
        Ok(())
    }
}

fn owned_config_map(name: String, pod: &Pod, data: BTreeMap<String, String>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            owner_references: Some(vec![pod_owner_ref(pod)]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    }
}

/// A plain owner reference to the build pod, so the ConfigMaps are collected with it
fn pod_owner_ref(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: Pod::api_version().into_owned(),
        kind: Pod::kind().into_owned(),
        name: pod.name_any(),
        uid: pod.uid().unwrap_or_default(),
        ..OwnerReference::default()
    }
}

fn same_owner(a: &OwnerReference, b: &OwnerReference) -> bool {
    a.api_version == b.api_version && a.kind == b.kind && a.name == b.name && a.uid == b.uid
}

fn set_env(env: &mut Vec<EnvVar>, name: &str, value: String) {
    match env.iter_mut().find(|e| e.name == name) {
        Some(var) => var.value = Some(value),
        None => env.push(EnvVar {
            name: name.to_owned(),
            value: Some(value),
            value_from: None,
        }),
    }
}
