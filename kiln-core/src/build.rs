//! The `Build` resource and its phase state machine
use std::fmt;

use k8s_openapi::{
    api::core::v1::{EnvVar, LocalObjectReference, ObjectReference},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    NamespaceResourceScope,
};
use serde::{Deserialize, Serialize};

use crate::{labels, Error, ResourceExt, RunPolicy};

/// A single execution of a build strategy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Standard object metadata
    pub metadata: ObjectMeta,
    /// What to build and how
    #[serde(default)]
    pub spec: BuildSpec,
    /// Most recently observed state
    #[serde(default)]
    pub status: BuildStatus,
}

impl_resource!(
    Build,
    group = "build.openshift.io",
    version = "v1",
    kind = "Build",
    plural = "builds",
    scope = NamespaceResourceScope
);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Service account used to run the build pod, `builder` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default)]
    pub source: BuildSource,
    #[serde(default)]
    pub strategy: BuildStrategy,
    #[serde(default)]
    pub output: BuildOutput,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitBuildSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<String>,
    /// Images whose content is copied into the build context
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageSource>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitBuildSource {
    pub uri: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub from: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<LocalObjectReference>,
}

/// Exactly one strategy is expected to be set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_strategy: Option<DockerBuildStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_strategy: Option<SourceBuildStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_strategy: Option<CustomBuildStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jenkins_pipeline_strategy: Option<JenkinsPipelineBuildStrategy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerBuildStrategy {
    /// Overrides the `FROM` image of the Dockerfile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBuildStrategy {
    /// The builder image
    pub from: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomBuildStrategy {
    /// The image that runs the build
    pub from: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JenkinsPipelineBuildStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jenkinsfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jenkinsfile_path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    /// Where the resulting image is pushed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_secret: Option<LocalObjectReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default)]
    pub phase: BuildPhase,
    /// Set by clients to request that an active build is stopped
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<Time>,
    /// Wall time of the build in nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_docker_image_reference: Option<String>,
    /// The build config this build was created from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ObjectReference>,
    /// Tail of the output of a failed build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_snippet: Option<String>,
}

/// Lifecycle phase of a build
///
/// ```text
/// New -> Pending -> Running -> {Complete, Failed, Error, Cancelled}
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildPhase {
    /// Created, waiting for admission and a pod
    #[default]
    New,
    /// Pod created, not yet running
    Pending,
    /// Pod is running
    Running,
    /// Finished successfully
    Complete,
    /// Finished unsuccessfully because of the build itself
    Failed,
    /// Finished unsuccessfully because of the system
    Error,
    /// Stopped on request
    Cancelled,
}

impl BuildPhase {
    /// Terminal phases are never left
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildPhase::Complete | BuildPhase::Failed | BuildPhase::Error | BuildPhase::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: BuildPhase) -> bool {
        if self == next {
            return true;
        }
        match self {
            from if from.is_terminal() => false,
            BuildPhase::Pending => next != BuildPhase::New,
            BuildPhase::Running => !matches!(next, BuildPhase::New | BuildPhase::Pending),
            _ => true,
        }
    }

    /// Returns an error unless the move is allowed
    pub fn validate_transition(self, next: BuildPhase) -> Result<(), Error> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from: self, to: next })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::New => "New",
            BuildPhase::Pending => "Pending",
            BuildPhase::Running => "Running",
            BuildPhase::Complete => "Complete",
            BuildPhase::Failed => "Failed",
            BuildPhase::Error => "Error",
            BuildPhase::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine readable explanation stored in `status.reason`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusReason {
    CannotCreateBuildPodSpec,
    CannotCreateBuildPod,
    InvalidOutputReference,
    InvalidImageReference,
    CancelledBuild,
    BuildPodDeleted,
    MissingPushSecret,
    BuildPodExists,
    NoBuildContainerStatus,
    FailedContainer,
    UnresolvableEnvironmentVariable,
    GenericBuildFailed,
    CannotRetrieveServiceAccount,
    OutOfMemoryKilled,
    BuildPodEvicted,
    CannotCreateCAConfigMap,
    CannotCreateBuildSysConfigMap,
}

impl StatusReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusReason::CannotCreateBuildPodSpec => "CannotCreateBuildPodSpec",
            StatusReason::CannotCreateBuildPod => "CannotCreateBuildPod",
            StatusReason::InvalidOutputReference => "InvalidOutputReference",
            StatusReason::InvalidImageReference => "InvalidImageReference",
            StatusReason::CancelledBuild => "CancelledBuild",
            StatusReason::BuildPodDeleted => "BuildPodDeleted",
            StatusReason::MissingPushSecret => "MissingPushSecret",
            StatusReason::BuildPodExists => "BuildPodExists",
            StatusReason::NoBuildContainerStatus => "NoBuildContainerStatus",
            StatusReason::FailedContainer => "FailedContainer",
            StatusReason::UnresolvableEnvironmentVariable => "UnresolvableEnvironmentVariable",
            StatusReason::GenericBuildFailed => "GenericBuildFailed",
            StatusReason::CannotRetrieveServiceAccount => "CannotRetrieveServiceAccount",
            StatusReason::OutOfMemoryKilled => "OutOfMemoryKilled",
            StatusReason::BuildPodEvicted => "BuildPodEvicted",
            StatusReason::CannotCreateCAConfigMap => "CannotCreateCAConfigMap",
            StatusReason::CannotCreateBuildSysConfigMap => "CannotCreateBuildSysConfigMap",
        }
    }
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StatusReason> for String {
    fn from(reason: StatusReason) -> String {
        reason.as_str().to_owned()
    }
}

impl PartialEq<StatusReason> for Option<String> {
    fn eq(&self, other: &StatusReason) -> bool {
        self.as_deref() == Some(other.as_str())
    }
}

/// Which strategy a build uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Docker,
    Source,
    Custom,
    JenkinsPipeline,
}

impl Build {
    pub fn phase(&self) -> BuildPhase {
        self.status.phase
    }

    /// Which strategy is set, if any
    pub fn strategy_kind(&self) -> Option<StrategyKind> {
        let s = &self.spec.strategy;
        if s.docker_strategy.is_some() {
            Some(StrategyKind::Docker)
        } else if s.source_strategy.is_some() {
            Some(StrategyKind::Source)
        } else if s.custom_strategy.is_some() {
            Some(StrategyKind::Custom)
        } else if s.jenkins_pipeline_strategy.is_some() {
            Some(StrategyKind::JenkinsPipeline)
        } else {
            None
        }
    }

    pub fn is_pipeline(&self) -> bool {
        self.strategy_kind() == Some(StrategyKind::JenkinsPipeline)
    }

    /// The image the strategy runs or builds from
    pub fn strategy_from(&self) -> Option<&ObjectReference> {
        let s = &self.spec.strategy;
        s.source_strategy
            .as_ref()
            .map(|s| &s.from)
            .or_else(|| s.docker_strategy.as_ref().and_then(|s| s.from.as_ref()))
            .or_else(|| s.custom_strategy.as_ref().map(|s| &s.from))
    }

    /// Mutable access to the pull secret of the active strategy
    ///
    /// `None` for pipeline builds and builds without a strategy.
    pub fn strategy_pull_secret_mut(&mut self) -> Option<&mut Option<LocalObjectReference>> {
        let s = &mut self.spec.strategy;
        if let Some(source) = s.source_strategy.as_mut() {
            Some(&mut source.pull_secret)
        } else if let Some(docker) = s.docker_strategy.as_mut() {
            Some(&mut docker.pull_secret)
        } else {
            s.custom_strategy.as_mut().map(|c| &mut c.pull_secret)
        }
    }

    /// Name of the build config that created this build
    ///
    /// Looks at the annotation first, then the label, then the legacy label.
    pub fn config_name(&self) -> Option<&str> {
        [
            self.annotations().get(labels::BUILD_CONFIG_ANNOTATION),
            self.labels().get(labels::BUILD_CONFIG_LABEL),
            self.labels().get(labels::BUILD_CONFIG_LABEL_DEPRECATED),
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .find(|name| !name.is_empty())
    }

    /// The sequence number assigned by the build config
    pub fn number(&self) -> Result<i64, Error> {
        let name = self.name_any();
        let value = self
            .annotations()
            .get(labels::BUILD_NUMBER_ANNOTATION)
            .ok_or_else(|| Error::MissingBuildNumber(name.clone()))?;
        value.parse().map_err(|source| Error::InvalidBuildNumber {
            name,
            value: value.clone(),
            source,
        })
    }

    /// The run policy label, defaulting to [`RunPolicy::Serial`]
    pub fn run_policy(&self) -> RunPolicy {
        self.labels()
            .get(labels::BUILD_RUN_POLICY_LABEL)
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    }

    /// The pod name recorded on the build, if any
    pub fn pod_name_annotation(&self) -> Option<&str> {
        self.annotations()
            .get(labels::BUILD_POD_NAME_ANNOTATION)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const ALL: [BuildPhase; 7] = [
        BuildPhase::New,
        BuildPhase::Pending,
        BuildPhase::Running,
        BuildPhase::Complete,
        BuildPhase::Failed,
        BuildPhase::Error,
        BuildPhase::Cancelled,
    ];

    #[test]
    fn identity_transitions_are_valid() {
        for phase in ALL {
            assert!(phase.can_transition_to(phase), "{phase}");
        }
    }

    #[test]
    fn terminal_phases_are_final() {
        for from in ALL.into_iter().filter(|p| p.is_terminal()) {
            for to in ALL.into_iter().filter(|p| *p != from) {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn active_transitions() {
        use BuildPhase::*;
        assert!(!Pending.can_transition_to(New));
        assert!(!Running.can_transition_to(New));
        assert!(!Running.can_transition_to(Pending));
        for to in ALL {
            assert!(New.can_transition_to(to));
        }
        for to in [Running, Complete, Failed, Error, Cancelled] {
            assert!(Pending.can_transition_to(to));
        }
        for to in [Complete, Failed, Error, Cancelled] {
            assert!(Running.can_transition_to(to));
        }
        assert!(matches!(
            Running.validate_transition(Pending),
            Err(crate::Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn status_wire_format() {
        let build: Build = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "ruby-1", "namespace": "app" },
            "spec": {
                "strategy": { "sourceStrategy": { "from": { "kind": "DockerImage", "name": "ruby" } } }
            },
            "status": { "phase": "Running", "cancelled": true }
        }))
        .unwrap();
        assert_eq!(build.phase(), BuildPhase::Running);
        assert!(build.status.cancelled);
        assert_eq!(build.strategy_kind(), Some(StrategyKind::Source));
        assert_eq!(build.strategy_from().unwrap().name.as_deref(), Some("ruby"));

        let empty: Build = serde_json::from_value(serde_json::json!({ "metadata": {} })).unwrap();
        assert_eq!(empty.phase(), BuildPhase::New);
        let value = serde_json::to_value(&empty.status).unwrap();
        assert_eq!(value, serde_json::json!({ "phase": "New" }));
    }

    #[test]
    fn labels_and_annotations() {
        let mut build = Build::default();
        build.metadata.name = Some("ruby-3".into());
        assert!(matches!(build.number(), Err(Error::MissingBuildNumber(_))));
        assert_eq!(build.run_policy(), RunPolicy::Serial);
        assert_eq!(build.config_name(), None);

        build.metadata.annotations = Some(BTreeMap::from([(
            labels::BUILD_NUMBER_ANNOTATION.into(),
            "x".into(),
        )]));
        assert!(matches!(build.number(), Err(Error::InvalidBuildNumber { .. })));

        build.metadata.annotations = Some(BTreeMap::from([(
            labels::BUILD_NUMBER_ANNOTATION.into(),
            "3".into(),
        )]));
        build.metadata.labels = Some(BTreeMap::from([
            (labels::BUILD_CONFIG_LABEL_DEPRECATED.into(), "ruby".into()),
            (labels::BUILD_RUN_POLICY_LABEL.into(), "Parallel".into()),
        ]));
        assert_eq!(build.number().unwrap(), 3);
        assert_eq!(build.config_name(), Some("ruby"));
        assert_eq!(build.run_policy(), RunPolicy::Parallel);

        build
            .labels_mut()
            .insert(labels::BUILD_RUN_POLICY_LABEL.into(), "Sometimes".into());
        assert_eq!(build.run_policy(), RunPolicy::Serial);
    }

    #[test]
    fn reason_comparison() {
        let reason = Some(String::from(StatusReason::MissingPushSecret));
        assert!(reason == StatusReason::MissingPushSecret);
        let unset: Option<String> = None;
        assert!(unset != StatusReason::MissingPushSecret);
    }
}
