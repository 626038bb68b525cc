use k8s_openapi::{api::core::v1::LocalObjectReference, apimachinery::pkg::apis::meta::v1::Time};

use crate::{labels, Build, BuildPhase, ResourceExt, StatusReason};

/// A sparse set of changes to a build, applied as a single patch
///
/// An empty reason or message clears the field on the build.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildUpdate {
    pub phase: Option<BuildPhase>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub start_time: Option<Time>,
    pub completion_time: Option<Time>,
    /// Nanoseconds
    pub duration: Option<i64>,
    pub output_ref: Option<String>,
    pub pod_name_annotation: Option<String>,
    pub push_secret: Option<LocalObjectReference>,
    pub log_snippet: Option<String>,
}

impl BuildUpdate {
    /// An update moving the build to `phase` with the given explanation
    pub fn transition(phase: BuildPhase, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            reason: Some(reason.into()),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A phase change that clears reason and message
    pub fn phase(phase: BuildPhase) -> Self {
        Self::transition(phase, "", "")
    }

    pub fn set_phase(&mut self, phase: BuildPhase) {
        self.phase = Some(phase);
    }

    pub fn set_reason(&mut self, reason: StatusReason) {
        self.reason = Some(reason.into());
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn set_start_time(&mut self, time: Time) {
        self.start_time = Some(time);
    }

    pub fn set_completion_time(&mut self, time: Time) {
        self.completion_time = Some(time);
    }

    pub fn set_duration(&mut self, nanos: i64) {
        self.duration = Some(nanos);
    }

    pub fn set_output_ref(&mut self, reference: impl Into<String>) {
        self.output_ref = Some(reference.into());
    }

    pub fn set_pod_name_annotation(&mut self, name: impl Into<String>) {
        self.pod_name_annotation = Some(name.into());
    }

    pub fn set_push_secret(&mut self, secret: LocalObjectReference) {
        self.push_secret = Some(secret);
    }

    pub fn set_log_snippet(&mut self, snippet: impl Into<String>) {
        self.log_snippet = Some(snippet.into());
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Writes every set field into `build`
    pub fn apply(&self, build: &mut Build) {
        if let Some(phase) = self.phase {
            build.status.phase = phase;
        }
        if let Some(reason) = &self.reason {
            build.status.reason = Some(reason.clone()).filter(|r| !r.is_empty());
        }
        if let Some(message) = &self.message {
            build.status.message = Some(message.clone()).filter(|m| !m.is_empty());
        }
        if let Some(start) = &self.start_time {
            build.status.start_timestamp = Some(start.clone());
        }
        if let Some(completion) = &self.completion_time {
            build.status.completion_timestamp = Some(completion.clone());
        }
        if let Some(duration) = self.duration {
            build.status.duration = Some(duration);
        }
        if let Some(output) = &self.output_ref {
            build.status.output_docker_image_reference = Some(output.clone());
        }
        if let Some(pod) = &self.pod_name_annotation {
            build
                .annotations_mut()
                .insert(labels::BUILD_POD_NAME_ANNOTATION.into(), pod.clone());
        }
        if let Some(secret) = &self.push_secret {
            build.spec.output.push_secret = Some(secret.clone());
        }
        if let Some(snippet) = &self.log_snippet {
            build.status.log_snippet = Some(snippet.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_update_is_empty() {
        assert!(BuildUpdate::default().is_empty());
        assert!(!BuildUpdate::phase(BuildPhase::Pending).is_empty());
    }

    #[test]
    fn apply_sets_and_clears() {
        let mut build = Build::default();
        build.status.reason = Some("InvalidOutputReference".into());
        build.status.message = Some("Output image could not be resolved.".into());

        let mut update = BuildUpdate::phase(BuildPhase::Pending);
        update.set_pod_name_annotation("ruby-1-build");
        update.set_output_ref("registry.svc:5000/app/ruby:latest");
        update.set_push_secret(LocalObjectReference { name: "builder-dockercfg".into() });
        update.apply(&mut build);

        assert_eq!(build.status.phase, BuildPhase::Pending);
        assert_eq!(build.status.reason, None);
        assert_eq!(build.status.message, None);
        assert_eq!(build.pod_name_annotation(), Some("ruby-1-build"));
        assert_eq!(
            build.status.output_docker_image_reference.as_deref(),
            Some("registry.svc:5000/app/ruby:latest")
        );
        assert_eq!(build.spec.output.push_secret.unwrap().name, "builder-dockercfg");
    }

    #[test]
    fn reason_only_update_keeps_phase() {
        let mut build = Build::default();
        let mut update = BuildUpdate::default();
        update.set_reason(StatusReason::CannotRetrieveServiceAccount);
        update.apply(&mut build);
        assert_eq!(build.status.phase, BuildPhase::New);
        assert!(build.status.reason == StatusReason::CannotRetrieveServiceAccount);
        assert_eq!(build.status.message, None);
    }
}
