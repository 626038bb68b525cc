//! Build pod construction
//!
//! The controller only depends on the [`PodFactory`] contract. [`TypeBasedFactory`] is
//! a minimal factory that picks the builder container from the build strategy.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, KeyToPath, Pod, PodSpec, Volume, VolumeMount,
};
use kiln_core::{
    build::StrategyKind,
    cluster::{BuildDefaults, BuildOverrides},
    labels, naming, Build, ObjectMeta, Resource, ResourceExt,
};
use thiserror::Error;

/// Name of the init container that fetches git sources
///
/// A pending pod whose `git-clone` container has started counts as running.
pub const GIT_CLONE_CONTAINER: &str = "git-clone";

/// ConfigMap key of the integrated registry's service CA
pub const SERVICE_CA_KEY: &str = "service-ca.crt";

const CA_VOLUME: &str = "build-ca-bundles";
const CA_MOUNT_PATH: &str = "/var/run/configs/openshift.io/certs";
const SYSTEM_CONFIG_VOLUME: &str = "build-system-configs";
const SYSTEM_CONFIG_MOUNT_PATH: &str = "/var/run/configs/openshift.io/build-system";

/// Env var holding the serialized build handed to the builder
pub const BUILD_ENV: &str = "BUILD";

/// Env var pointing a custom builder at its own image
pub const CUSTOM_BUILD_BASE_IMAGE_ENV: &str = "OPENSHIFT_CUSTOM_BUILD_BASE_IMAGE";

/// Why a build pod could not be described
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    /// The build will never produce a pod, retrying is pointless
    #[error("{0}")]
    Fatal(String),
    /// The build cannot produce a pod right now
    #[error("{0}")]
    Invalid(String),
}

impl StrategyError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StrategyError::Fatal(_))
    }
}

/// Describes the pod that runs a build
///
/// Implementations must be pure: the controller creates the returned pod as is, after
/// applying cluster defaults and overrides.
pub trait PodFactory: Send + Sync {
    /// `additional_cas` maps registry hosts to PEM bundles that end up in the build's
    /// CA ConfigMap.
    fn create_build_pod(
        &self,
        build: &Build,
        additional_cas: &BTreeMap<String, String>,
        internal_registry: Option<&str>,
    ) -> Result<Pod, StrategyError>;
}

/// Chooses the builder container by strategy type
#[derive(Clone, Debug)]
pub struct TypeBasedFactory {
    builder_image: String,
}

impl TypeBasedFactory {
    /// `builder_image` runs docker and source builds
    pub fn new(builder_image: impl Into<String>) -> Self {
        Self {
            builder_image: builder_image.into(),
        }
    }
}

impl PodFactory for TypeBasedFactory {
    fn create_build_pod(
        &self,
        build: &Build,
        additional_cas: &BTreeMap<String, String>,
        internal_registry: Option<&str>,
    ) -> Result<Pod, StrategyError> {
        let strategy = &build.spec.strategy;
        let (container_name, image, command, strategy_env) = match build.strategy_kind() {
            Some(StrategyKind::Docker) => (
                "docker-build",
                self.builder_image.clone(),
                "openshift-docker-build",
                strategy.docker_strategy.as_ref().map(|s| s.env.clone()),
            ),
            Some(StrategyKind::Source) => (
                "sti-build",
                self.builder_image.clone(),
                "openshift-sti-build",
                strategy.source_strategy.as_ref().map(|s| s.env.clone()),
            ),
            Some(StrategyKind::Custom) => {
                let custom = strategy.custom_strategy.as_ref();
                let image = custom
                    .and_then(|s| s.from.name.clone())
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| StrategyError::Invalid("custom strategy has no image".into()))?;
                ("custom-build", image, "", custom.map(|s| s.env.clone()))
            }
            Some(StrategyKind::JenkinsPipeline) => {
                return Err(StrategyError::Fatal(
                    "pipeline builds do not run in build pods".into(),
                ))
            }
            None => return Err(StrategyError::Fatal("no supported build strategy defined".into())),
        };

        let owner = build
            .controller_owner_ref()
            .ok_or_else(|| StrategyError::Invalid(format!("build {} has no uid", build.key())))?;
        let serialized = serde_json::to_string(build)
            .map_err(|e| StrategyError::Invalid(format!("failed to serialize build: {e}")))?;

        let mut env = vec![env_var(BUILD_ENV, serialized)];
        env.extend(strategy_env.unwrap_or_default());

        let mounts = vec![
            VolumeMount {
                name: CA_VOLUME.into(),
                mount_path: CA_MOUNT_PATH.into(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
            VolumeMount {
                name: SYSTEM_CONFIG_VOLUME.into(),
                mount_path: SYSTEM_CONFIG_MOUNT_PATH.into(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        ];

        let init_containers = build.spec.source.git.as_ref().map(|_| {
            vec![Container {
                name: GIT_CLONE_CONTAINER.into(),
                image: Some(self.builder_image.clone()),
                args: Some(vec!["openshift-git-clone".into()]),
                env: Some(env.clone()),
                volume_mounts: Some(mounts.clone()),
                ..Container::default()
            }]
        });
        let main = Container {
            name: container_name.into(),
            image: Some(image),
            args: Some(vec![command.to_owned()]).filter(|_| !command.is_empty()),
            env: Some(env),
            volume_mounts: Some(mounts),
            ..Container::default()
        };

        let name = build.name_any();
        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(naming::build_pod_name(build)),
                namespace: build.namespace(),
                labels: Some(BTreeMap::from([(
                    labels::BUILD_LABEL.to_owned(),
                    labels::label_value(&name).to_owned(),
                )])),
                annotations: Some(BTreeMap::from([(labels::BUILD_ANNOTATION.to_owned(), name)])),
                owner_references: Some(vec![owner]),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                service_account_name: Some(
                    build
                        .spec
                        .service_account
                        .clone()
                        .filter(|sa| !sa.is_empty())
                        .unwrap_or_else(|| crate::secrets::BUILDER_SERVICE_ACCOUNT.to_owned()),
                ),
                restart_policy: Some("Never".into()),
                init_containers,
                containers: vec![main],
                volumes: Some(vec![
                    ca_volume(build, additional_cas, internal_registry),
                    config_map_volume(
                        SYSTEM_CONFIG_VOLUME,
                        naming::build_system_config_map_name(build),
                        None,
                    ),
                ]),
                ..PodSpec::default()
            }),
            status: None,
        })
    }
}

/// Lays the CA bundles out as `<host>/ca.crt`
///
/// ConfigMap keys spell the port separator of a registry host as `..`.
fn ca_volume(
    build: &Build,
    additional_cas: &BTreeMap<String, String>,
    internal_registry: Option<&str>,
) -> Volume {
    let mut items: Vec<KeyToPath> = additional_cas
        .keys()
        .map(|host| KeyToPath {
            key: host.clone(),
            path: format!("{}/ca.crt", host.replace("..", ":")),
            mode: None,
        })
        .collect();
    if let Some(registry) = internal_registry.filter(|r| !r.is_empty()) {
        items.push(KeyToPath {
            key: SERVICE_CA_KEY.into(),
            path: format!("{registry}/ca.crt"),
            mode: None,
        });
    }
    config_map_volume(CA_VOLUME, naming::build_ca_config_map_name(build), Some(items))
}

fn config_map_volume(volume: &str, config_map: String, items: Option<Vec<KeyToPath>>) -> Volume {
    Volume {
        name: volume.into(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map,
            items: items.filter(|i| !i.is_empty()),
            optional: Some(true),
            ..ConfigMapVolumeSource::default()
        }),
        ..Volume::default()
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn set_default_env(env: &mut Vec<EnvVar>, name: &str, value: &str) {
    if !env.iter().any(|e| e.name == name) {
        env.push(env_var(name, value));
    }
}

fn all_containers(pod: &mut Pod) -> impl Iterator<Item = &mut Container> {
    pod.spec.iter_mut().flat_map(|spec| {
        spec.init_containers
            .iter_mut()
            .flatten()
            .chain(spec.containers.iter_mut())
    })
}

/// Adds cluster default proxy and env settings the build does not set itself
pub fn apply_defaults(pod: &mut Pod, defaults: &BuildDefaults) {
    let mut vars: Vec<(String, String)> = Vec::new();
    if let Some(proxy) = &defaults.default_proxy {
        for (name, value) in [
            ("HTTP_PROXY", &proxy.http_proxy),
            ("HTTPS_PROXY", &proxy.https_proxy),
            ("NO_PROXY", &proxy.no_proxy),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                vars.push((name.to_owned(), value.to_owned()));
                vars.push((name.to_lowercase(), value.to_owned()));
            }
        }
    }
    vars.extend(
        defaults
            .env
            .iter()
            .filter_map(|e| Some((e.name.clone(), e.value.clone()?))),
    );
    if vars.is_empty() {
        return;
    }
    for container in all_containers(pod) {
        let env = container.env.get_or_insert_with(Vec::new);
        for (name, value) in &vars {
            set_default_env(env, name, value);
        }
    }
}

/// Forces the cluster node selector and tolerations onto the pod
pub fn apply_overrides(pod: &mut Pod, overrides: &BuildOverrides) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };
    if !overrides.node_selector.is_empty() {
        spec.node_selector
            .get_or_insert_with(BTreeMap::new)
            .extend(overrides.node_selector.clone());
    }
    if !overrides.tolerations.is_empty() {
        spec.tolerations = Some(overrides.tolerations.clone());
    }
}

/// Whether `pod` carries a controller reference to this incarnation of `build`
pub fn is_owned_by(pod: &Pod, build: &Build) -> bool {
    let uid = build.uid();
    pod.owner_references().iter().any(|owner| {
        owner.kind == Build::kind()
            && Some(owner.name.as_str()) == build.meta().name.as_deref()
            && Some(&owner.uid) == uid.as_ref()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ObjectReference, Toleration};
    use kiln_core::{
        build::{CustomBuildStrategy, GitBuildSource, JenkinsPipelineBuildStrategy, SourceBuildStrategy},
        cluster::ProxySpec,
    };

    fn source_build() -> Build {
        let mut build = Build::default();
        build.metadata.name = Some("ruby-1".into());
        build.metadata.namespace = Some("app".into());
        build.metadata.uid = Some("b-1".into());
        build.spec.source.git = Some(GitBuildSource {
            uri: "https://github.com/sclorg/ruby-ex".into(),
            ref_: None,
        });
        build.spec.strategy.source_strategy = Some(SourceBuildStrategy {
            from: ObjectReference {
                kind: Some("DockerImage".into()),
                name: Some("quay.io/ruby:2.7".into()),
                ..ObjectReference::default()
            },
            env: vec![env_var("HTTP_PROXY", "http://own:80")],
            ..SourceBuildStrategy::default()
        });
        build
    }

    fn env_of<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
        container
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn source_build_pod() {
        let build = source_build();
        let cas = BTreeMap::from([("registry.local..5000".to_string(), "PEM".to_string())]);
        let pod = TypeBasedFactory::new("builder:latest")
            .create_build_pod(&build, &cas, Some("image-registry.svc:5000"))
            .unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("ruby-1-build"));
        assert_eq!(pod.annotations()[labels::BUILD_ANNOTATION], "ruby-1");
        assert!(is_owned_by(&pod, &build));

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.service_account_name.as_deref(), Some("builder"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, GIT_CLONE_CONTAINER);
        let main = &spec.containers[0];
        assert_eq!(main.name, "sti-build");
        assert_eq!(env_of(main, "HTTP_PROXY"), Some("http://own:80"));
        let serialized: Build = serde_json::from_str(env_of(main, BUILD_ENV).unwrap()).unwrap();
        assert_eq!(serialized, build);

        let ca = spec.volumes.as_ref().unwrap()[0].config_map.as_ref().unwrap();
        assert_eq!(ca.name, "ruby-1-ca");
        let paths: Vec<&str> = ca.items.iter().flatten().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, ["registry.local:5000/ca.crt", "image-registry.svc:5000/ca.crt"]);
    }

    #[test]
    fn unsupported_strategies() {
        let factory = TypeBasedFactory::new("builder:latest");
        let mut build = source_build();
        build.spec.strategy = Default::default();
        let err = factory.create_build_pod(&build, &BTreeMap::new(), None).unwrap_err();
        assert!(err.is_fatal());

        build.spec.strategy.jenkins_pipeline_strategy = Some(JenkinsPipelineBuildStrategy::default());
        assert!(factory
            .create_build_pod(&build, &BTreeMap::new(), None)
            .unwrap_err()
            .is_fatal());

        build.spec.strategy = Default::default();
        build.spec.strategy.custom_strategy = Some(CustomBuildStrategy::default());
        let err = factory.create_build_pod(&build, &BTreeMap::new(), None).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn defaults_do_not_override_build_env() {
        let build = source_build();
        let mut pod = TypeBasedFactory::new("builder:latest")
            .create_build_pod(&build, &BTreeMap::new(), None)
            .unwrap();
        let defaults = BuildDefaults {
            default_proxy: Some(ProxySpec {
                http_proxy: Some("http://proxy:3128".into()),
                https_proxy: None,
                no_proxy: Some(".cluster.local".into()),
            }),
            env: vec![env_var("GIT_SSL_NO_VERIFY", "true")],
        };
        apply_defaults(&mut pod, &defaults);

        let spec = pod.spec.as_ref().unwrap();
        for container in spec.init_containers.iter().flatten().chain(&spec.containers) {
            assert_eq!(env_of(container, "HTTP_PROXY"), Some("http://own:80"));
            assert_eq!(env_of(container, "http_proxy"), Some("http://proxy:3128"));
            assert_eq!(env_of(container, "NO_PROXY"), Some(".cluster.local"));
            assert_eq!(env_of(container, "HTTPS_PROXY"), None);
            assert_eq!(env_of(container, "GIT_SSL_NO_VERIFY"), Some("true"));
        }
    }

    #[test]
    fn overrides_replace_scheduling() {
        let mut pod = TypeBasedFactory::new("builder:latest")
            .create_build_pod(&source_build(), &BTreeMap::new(), None)
            .unwrap();
        pod.spec.as_mut().unwrap().tolerations = Some(vec![Toleration {
            key: Some("old".into()),
            ..Toleration::default()
        }]);
        let overrides = BuildOverrides {
            node_selector: BTreeMap::from([("role".to_string(), "builds".to_string())]),
            tolerations: vec![Toleration {
                key: Some("builds".into()),
                operator: Some("Exists".into()),
                ..Toleration::default()
            }],
        };
        apply_overrides(&mut pod, &overrides);
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_selector.unwrap()["role"], "builds");
        let tolerations = spec.tolerations.unwrap();
        assert_eq!(tolerations.len(), 1);
        assert_eq!(tolerations[0].key.as_deref(), Some("builds"));
    }

    #[test]
    fn ownership_requires_matching_uid() {
        let build = source_build();
        let pod = TypeBasedFactory::new("builder:latest")
            .create_build_pod(&build, &BTreeMap::new(), None)
            .unwrap();
        let mut recreated = build.clone();
        recreated.metadata.uid = Some("b-2".into());
        assert!(!is_owned_by(&pod, &recreated));
    }
}
