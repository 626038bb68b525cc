use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};
use kiln_client::api::delete_ignore_missing;
use kiln_core::{
    naming::build_pod_name, update::BuildUpdate, Build, BuildPhase, ResourceExt, StatusReason,
};
use kiln_runtime::events::NewEvent;
use tracing::{debug, info, warn};

use super::BuildController;
use crate::{
    policy::Policy,
    prune::prune_builds,
    strategy::{is_owned_by, GIT_CLONE_CONTAINER},
    Error, Result,
};

const POD_PENDING: &str = "Pending";
const POD_RUNNING: &str = "Running";
const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

const OOM_KILLED: &str = "OOMKilled";
const EVICTED: &str = "Evicted";

impl BuildController {
    /// Moves `build` one step closer to a terminal phase
    pub(crate) async fn handle_build(&self, build: &Build) -> Result<()> {
        if build.is_pipeline() && build.phase().is_terminal() {
            if let Some(config) = build.config_name() {
                let namespace = build.namespace().unwrap_or_default();
                if let Err(err) = prune_builds(
                    &namespace,
                    config,
                    &self.stores.builds,
                    &self.stores.build_configs,
                    &*self.clients.builds,
                )
                .await
                {
                    warn!(%err, "failed to prune builds");
                }
            }
        }
        if should_ignore(build) {
            return Ok(());
        }
        debug!(phase = %build.phase(), "handling build");

        let namespace = build.namespace().unwrap_or_default();
        let pod = self.stores.pods.get_namespaced(&namespace, &build_pod_name(build));

        let mut update = BuildUpdate::default();
        let result = if !build.phase().is_terminal() && build.status.cancelled {
            self.cancel_build(build, &mut update).await
        } else {
            match build.phase() {
                BuildPhase::New => self.handle_new_build(build, pod.as_deref(), &mut update).await,
                BuildPhase::Pending | BuildPhase::Running => {
                    self.handle_active_build(build, pod.as_deref(), &mut update).await
                }
                _ => {
                    self.handle_completed_build(build, pod.as_deref(), &mut update);
                    Ok(())
                }
            }
        };

        let updated = if update.is_empty() {
            Ok(())
        } else {
            self.update_build(build, update, pod.as_deref()).await
        };
        result?;
        updated
    }

    async fn cancel_build(&self, build: &Build, update: &mut BuildUpdate) -> Result<()> {
        let namespace = build.namespace().unwrap_or_default();
        let pod = build_pod_name(build);
        info!(%pod, "cancelling build");
        delete_ignore_missing(&*self.clients.pods, &namespace, &pod)
            .await
            .map_err(|source| Error::CancelBuild {
                namespace: namespace.clone(),
                pod,
                source,
            })?;
        *update = BuildUpdate::transition(
            BuildPhase::Cancelled,
            StatusReason::CancelledBuild,
            "The build was cancelled by the user.",
        );
        Ok(())
    }

    async fn handle_new_build(
        &self,
        build: &Build,
        pod: Option<&Pod>,
        update: &mut BuildUpdate,
    ) -> Result<()> {
        if let Some(pod) = pod {
            if is_owned_by(pod, build) {
                return self.handle_active_build(build, Some(pod), update).await;
            }
            *update = BuildUpdate::transition(
                BuildPhase::Error,
                StatusReason::BuildPodExists,
                "The pod for this build already exists and is older than the build.",
            );
            return Ok(());
        }

        let policy = Policy::for_build(build);
        if !policy
            .is_runnable(build, &self.stores.builds, &*self.clients.builds)
            .await?
        {
            debug!(?policy, "build is not runnable yet");
            return Ok(());
        }
        self.create_build_pod(build, update).await
    }

    async fn handle_active_build(
        &self,
        build: &Build,
        pod: Option<&Pod>,
        update: &mut BuildUpdate,
    ) -> Result<()> {
        let fetched;
        let pod = match pod {
            Some(pod) => pod,
            None => match self.find_missing_pod(build).await? {
                Some(pod) => {
                    fetched = pod;
                    &fetched
                }
                None => {
                    *update = BuildUpdate::transition(
                        BuildPhase::Error,
                        StatusReason::BuildPodDeleted,
                        "The pod for this build was deleted before the build completed.",
                    );
                    return Ok(());
                }
            },
        };

        let phase = pod_phase(pod);
        match phase {
            POD_PENDING => self.handle_pending_pod(build, update).await,
            POD_RUNNING => {
                if build.phase() != BuildPhase::Running {
                    *update = BuildUpdate::phase(BuildPhase::Running);
                    if let Some(start) = pod.status.as_ref().and_then(|s| s.start_time.clone()) {
                        update.set_start_time(start);
                    }
                }
            }
            POD_SUCCEEDED => {
                if build.phase() != BuildPhase::Complete {
                    *update = BuildUpdate::phase(BuildPhase::Complete);
                }
                let statuses = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.container_statuses.as_deref())
                    .unwrap_or_default();
                if statuses.is_empty() {
                    *update = BuildUpdate::transition(
                        BuildPhase::Error,
                        StatusReason::NoBuildContainerStatus,
                        "The pod for this build has no container statuses indicating success or failure.",
                    );
                } else if statuses
                    .iter()
                    .filter_map(|s| s.state.as_ref()?.terminated.as_ref())
                    .any(|t| t.exit_code != 0)
                {
                    *update = BuildUpdate::transition(
                        BuildPhase::Error,
                        StatusReason::FailedContainer,
                        "The pod for this build has at least one container with a non-zero exit status.",
                    );
                }
            }
            POD_FAILED => {
                if is_oom_killed(Some(pod)) {
                    *update = oom_killed_update();
                } else if is_pod_evicted(pod) {
                    let message = pod.status.as_ref().and_then(|s| s.message.clone()).unwrap_or_default();
                    *update =
                        BuildUpdate::transition(BuildPhase::Failed, StatusReason::BuildPodEvicted, message);
                } else if build.phase() != BuildPhase::Failed {
                    *update = if pod.is_being_deleted() {
                        BuildUpdate::transition(
                            BuildPhase::Error,
                            StatusReason::BuildPodDeleted,
                            "The pod for this build was deleted before the build completed.",
                        )
                    } else {
                        BuildUpdate::transition(
                            BuildPhase::Failed,
                            StatusReason::GenericBuildFailed,
                            "Generic Build failure - check logs for details.",
                        )
                    };
                }
            }
            other => debug!(pod_phase = %other, "ignoring pod phase"),
        }
        Ok(())
    }

    async fn handle_pending_pod(&self, build: &Build, update: &mut BuildUpdate) {
        let namespace = build.namespace().unwrap_or_default();
        match build.phase() {
            BuildPhase::New | BuildPhase::Pending => {
                if build.phase() == BuildPhase::New {
                    *update = BuildUpdate::phase(BuildPhase::Pending);
                }
                let missing_push_secret = build
                    .spec
                    .output
                    .push_secret
                    .as_ref()
                    .filter(|s| !s.name.is_empty())
                    .is_some_and(|s| self.stores.secrets.get_namespaced(&namespace, &s.name).is_none());
                if missing_push_secret && build.status.reason != StatusReason::MissingPushSecret {
                    *update = BuildUpdate::transition(
                        BuildPhase::Pending,
                        StatusReason::MissingPushSecret,
                        "Missing push secret.",
                    );
                    info!("setting reason for pending build to MissingPushSecret");
                }
            }
            phase => {
                let note = format!(
                    "Build {namespace}/{} received a pod in pending phase event while in {phase} phase",
                    build.name_any()
                );
                self.record(build, NewEvent::warning("UnexpectedPodPhase", note)).await;
            }
        }
    }

    /// Direct lookup of a pod the cache does not know (yet)
    async fn find_missing_pod(&self, build: &Build) -> Result<Option<Pod>> {
        let namespace = build.namespace().unwrap_or_default();
        let pod = self
            .clients
            .pods
            .get_opt(&namespace, &build_pod_name(build))
            .await?;
        if pod.is_some() {
            debug!("found pod missing from the cache");
        }
        Ok(pod)
    }

    fn handle_completed_build(&self, build: &Build, pod: Option<&Pod>, update: &mut BuildUpdate) {
        if build.phase() == BuildPhase::Failed && is_oom_killed(pod) {
            *update = oom_killed_update();
        }
        self.set_build_completion_data(build, pod, update);
    }
}

/// Builds that need no further work
fn should_ignore(build: &Build) -> bool {
    if build.is_being_deleted() {
        debug!("ignoring build being deleted");
        return true;
    }
    if build.is_pipeline() {
        debug!("ignoring pipeline build");
        return true;
    }
    let completed = build.status.completion_timestamp.is_some();
    match build.phase() {
        BuildPhase::Complete => completed,
        BuildPhase::Failed => {
            completed && build.status.log_snippet.as_deref().is_some_and(|s| !s.is_empty())
        }
        BuildPhase::Error | BuildPhase::Cancelled => true,
        _ => false,
    }
}

/// The pod phase, reporting a pending pod whose source is already being fetched as running
fn pod_phase(pod: &Pod) -> &str {
    let Some(status) = pod.status.as_ref() else {
        return "";
    };
    let phase = status.phase.as_deref().unwrap_or_default();
    if phase != POD_PENDING {
        return phase;
    }
    let cloning = status
        .init_container_statuses
        .iter()
        .flatten()
        .filter(|s| s.name == GIT_CLONE_CONTAINER)
        .filter_map(|s| s.state.as_ref())
        .any(|state| state.running.is_some() || state.terminated.is_some());
    if cloning {
        POD_RUNNING
    } else {
        phase
    }
}

fn terminated_states(pod: &Pod) -> impl Iterator<Item = &ContainerStateTerminated> {
    pod.status.iter().flat_map(|status| {
        status
            .init_container_statuses
            .iter()
            .flatten()
            .chain(status.container_statuses.iter().flatten())
            .filter_map(|s| s.state.as_ref()?.terminated.as_ref())
    })
}

pub(crate) fn is_oom_killed(pod: Option<&Pod>) -> bool {
    let Some(pod) = pod else {
        return false;
    };
    let pod_reason = pod.status.as_ref().and_then(|s| s.reason.as_deref());
    pod_reason == Some(OOM_KILLED)
        || terminated_states(pod).any(|t| t.reason.as_deref() == Some(OOM_KILLED))
}

fn is_pod_evicted(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.reason.as_deref()) == Some(EVICTED)
}

fn oom_killed_update() -> BuildUpdate {
    BuildUpdate::transition(
        BuildPhase::Failed,
        StatusReason::OutOfMemoryKilled,
        "The build pod was killed due to an out of memory condition.",
    )
}
