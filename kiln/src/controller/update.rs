use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
};
use kiln_core::{update::BuildUpdate, Build, BuildPhase, Patch, ResourceExt};
use kiln_runtime::events::NewEvent;
use tracing::{debug, info, warn};

use super::BuildController;
use crate::{prune::prune_builds, Result};

const LOG_SNIPPET_LINES: usize = 5;
const LOG_SNIPPET_LINE_LENGTH: usize = 120;

impl BuildController {
    /// Applies `update` to `build` with a single patch
    ///
    /// Entering a terminal phase also records completion data, re-evaluates the build's
    /// group and prunes its history.
    pub(super) async fn update_build(
        &self,
        build: &Build,
        mut update: BuildUpdate,
        pod: Option<&Pod>,
    ) -> Result<()> {
        let mut transition = false;
        match update.phase {
            Some(phase) if phase != build.phase() => transition = true,
            _ if build.phase() == BuildPhase::Failed && update.completion_time.is_some() => {
                update.set_phase(BuildPhase::Failed);
                transition = true;
            }
            _ => {}
        }

        if transition {
            if let Some(phase) = update.phase {
                build.phase().validate_transition(phase)?;
                if phase.is_terminal() {
                    self.set_build_completion_data(build, pod, &mut update);
                }
                info!(from = %build.phase(), to = %phase, "updating build phase");
            }
        }

        if update.pod_name_annotation.is_none() && build.pod_name_annotation().is_none() {
            if let Some(pod) = pod {
                update.set_pod_name_annotation(pod.name_any());
            }
        }

        let mut updated = build.clone();
        update.apply(&mut updated);
        let namespace = build.namespace().unwrap_or_default();
        let patched = match Patch::diff(build, &updated)? {
            Some(patch) => {
                debug!(patch = %patch.value(), "patching build");
                self.clients.builds.patch(&namespace, &build.name_any(), &patch).await?
            }
            None => updated,
        };

        if !transition {
            return Ok(());
        }
        let note = |what: &str| format!("Build {namespace}/{} {what}", patched.name_any());
        let event = match patched.phase() {
            BuildPhase::Running => Some(NewEvent::normal("BuildStarted", note("is now running"))),
            BuildPhase::Cancelled => Some(NewEvent::normal("BuildCancelled", note("has been cancelled"))),
            BuildPhase::Complete => Some(NewEvent::normal("BuildCompleted", note("completed successfully"))),
            BuildPhase::Failed | BuildPhase::Error => Some(NewEvent::normal("BuildFailed", note("failed"))),
            BuildPhase::New | BuildPhase::Pending => None,
        };
        if let Some(event) = event {
            self.record(&patched, event).await;
        }
        if patched.phase().is_terminal() {
            self.handle_build_completion(&patched).await;
        }
        Ok(())
    }

    /// Re-evaluates the group of a finished build and prunes its history
    async fn handle_build_completion(&self, build: &Build) {
        let Some(config) = build.config_name() else {
            return;
        };
        let namespace = build.namespace().unwrap_or_default();
        self.group_queue.add(format!("{namespace}/{config}"));
        if let Err(err) = prune_builds(
            &namespace,
            config,
            &self.stores.builds,
            &self.stores.build_configs,
            &*self.clients.builds,
        )
        .await
        {
            warn!(%err, build_config = %config, "failed to prune builds");
        }
    }

    /// Backfills start and completion time, duration and, for failed builds, the log snippet
    ///
    /// Only fields the build does not have yet are set, so repeating this is a no-op.
    pub(super) fn set_build_completion_data(
        &self,
        build: &Build,
        pod: Option<&Pod>,
        update: &mut BuildUpdate,
    ) {
        let now = Time(Utc::now());

        let start = match &build.status.start_timestamp {
            Some(start) => start.clone(),
            None => {
                let start = pod
                    .and_then(|p| p.status.as_ref()?.start_time.clone())
                    .unwrap_or_else(|| now.clone());
                update.set_start_time(start.clone());
                start
            }
        };

        if build.status.completion_timestamp.is_none() {
            update.set_completion_time(now.clone());
            let seconds = now.0.timestamp() - start.0.timestamp();
            update.set_duration(seconds * 1_000_000_000);
        }

        let failed = build.phase() == BuildPhase::Failed || update.phase == Some(BuildPhase::Failed);
        let has_snippet = build.status.log_snippet.as_deref().is_some_and(|s| !s.is_empty());
        if failed && !has_snippet {
            if let Some(message) = pod.and_then(first_container_message).filter(|m| !m.is_empty()) {
                update.set_log_snippet(log_snippet(message));
            }
        }
    }
}

/// Termination message of the first build container
fn first_container_message(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .first()?
        .state
        .as_ref()?
        .terminated
        .as_ref()?
        .message
        .as_deref()
}

/// The last lines of `message`, eliding the middle of overlong lines
pub(super) fn log_snippet(message: &str) -> String {
    let lines: Vec<&str> = message.trim_end_matches('\n').split('\n').collect();
    let tail = &lines[lines.len().saturating_sub(LOG_SNIPPET_LINES)..];
    tail.iter()
        .map(|line| {
            let chars: Vec<char> = line.chars().collect();
            if chars.len() > LOG_SNIPPET_LINE_LENGTH {
                let head: String = chars[..58].iter().collect();
                let end: String = chars[chars.len() - 59..].iter().collect();
                format!("{head}...{end}")
            } else {
                (*line).to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
