//! Run policies decide which builds of a build config may start
//!
//! Every build carries its policy in the [`BUILD_RUN_POLICY_LABEL`] label. A build
//! that was not created from a build config is always runnable.
//!
//! [`BUILD_RUN_POLICY_LABEL`]: kiln_core::labels::BUILD_RUN_POLICY_LABEL
use std::sync::Arc;

use kiln_client::Api;
use kiln_core::{Build, BuildPhase, Patch, RunPolicy};
use kiln_runtime::Store;
use serde_json::json;
use tracing::debug;

use crate::{Error, Result};

/// Admission rule for the builds of one build config
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Start as soon as no serial build of the group is active
    Parallel,
    /// Start only when nothing else runs and this is the oldest queued build
    Serial,
    /// Like [`Policy::Serial`], cancelling every older queued build first
    SerialLatestOnly,
}

/// Policies in lookup order
const POLICIES: [Policy; 3] = [Policy::Parallel, Policy::Serial, Policy::SerialLatestOnly];

impl Policy {
    /// Whether this policy is responsible for builds labelled with `run_policy`
    pub fn handles(self, run_policy: RunPolicy) -> bool {
        matches!(
            (self, run_policy),
            (Policy::Parallel, RunPolicy::Parallel)
                | (Policy::Serial, RunPolicy::Serial)
                | (Policy::SerialLatestOnly, RunPolicy::SerialLatestOnly)
        )
    }

    /// The policy responsible for `build`
    pub fn for_build(build: &Build) -> Policy {
        let run_policy = build.run_policy();
        POLICIES
            .into_iter()
            .find(|p| p.handles(run_policy))
            .unwrap_or(Policy::Serial)
    }

    /// Whether `build` may start now
    ///
    /// `SerialLatestOnly` marks older queued builds of the group as cancelled through
    /// `api` before deciding.
    pub async fn is_runnable(
        self,
        build: &Build,
        builds: &Store<Build>,
        api: &dyn Api<Build>,
    ) -> Result<bool> {
        let namespace = build.metadata.namespace.as_deref();
        let (Some(namespace), Some(config)) = (namespace, build.config_name()) else {
            return Ok(true);
        };
        match self {
            Policy::Parallel => Ok(!has_running_serial_build(builds, namespace, config)),
            Policy::Serial => is_next_serial_build(build, builds, namespace, config),
            Policy::SerialLatestOnly => {
                cancel_previous_builds(build, builds, api, namespace, config).await?;
                is_next_serial_build(build, builds, namespace, config)
            }
        }
    }
}

fn is_next_serial_build(build: &Build, builds: &Store<Build>, namespace: &str, config: &str) -> Result<bool> {
    let (next, has_running_builds) = get_next_config_build(builds, namespace, config)?;
    if has_running_builds {
        debug!(
            build = %build.metadata.name.as_deref().unwrap_or_default(),
            %config,
            "group has running builds"
        );
        return Ok(false);
    }
    Ok(matches!(&next[..], [only] if only.metadata.name == build.metadata.name))
}

/// Cached builds of the build config `config`
pub fn config_builds(
    builds: &Store<Build>,
    namespace: &str,
    config: &str,
    predicate: impl Fn(&Build) -> bool,
) -> Vec<Arc<Build>> {
    builds.list_namespaced(namespace, |b| b.config_name() == Some(config) && predicate(b))
}

/// Whether a `Serial` or `SerialLatestOnly` build of the group is pending or running
pub fn has_running_serial_build(builds: &Store<Build>, namespace: &str, config: &str) -> bool {
    !config_builds(builds, namespace, config, |b| {
        matches!(b.phase(), BuildPhase::Pending | BuildPhase::Running) && b.run_policy().is_serial()
    })
    .is_empty()
}

/// The builds of a group that should start next, and whether any build of it is active
///
/// Picks the queued build with the lowest number. If that build is `Parallel`, every
/// queued `Parallel` build is returned, ordered by number.
pub fn get_next_config_build(
    builds: &Store<Build>,
    namespace: &str,
    config: &str,
) -> Result<(Vec<Arc<Build>>, bool)> {
    let group = config_builds(builds, namespace, config, |_| true);
    let has_running_builds = group
        .iter()
        .any(|b| matches!(b.phase(), BuildPhase::Pending | BuildPhase::Running));

    let mut queued = group
        .into_iter()
        .filter(|b| b.phase() == BuildPhase::New)
        .map(|b| Ok((b.number()?, b)))
        .collect::<Result<Vec<_>>>()?;
    queued.sort_by_key(|(number, _)| *number);

    let next = match queued.first() {
        Some((_, first)) if first.run_policy() == RunPolicy::Parallel => queued
            .into_iter()
            .filter(|(_, b)| b.run_policy() == RunPolicy::Parallel)
            .map(|(_, b)| b)
            .collect(),
        Some((_, first)) => vec![first.clone()],
        None => Vec::new(),
    };
    Ok((next, has_running_builds))
}

/// Marks older builds of the group that have not started running as cancelled
async fn cancel_previous_builds(
    build: &Build,
    builds: &Store<Build>,
    api: &dyn Api<Build>,
    namespace: &str,
    config: &str,
) -> Result<()> {
    let current = build.number()?;
    let superseded = config_builds(builds, namespace, config, |b| {
        !b.phase().is_terminal()
            && b.phase() != BuildPhase::Running
            && !b.status.cancelled
            && b.number().is_ok_and(|n| n < current)
    });

    let patch = Patch::Merge(json!({ "status": { "cancelled": true } }));
    let mut errors = Vec::new();
    for older in superseded {
        let name = older.metadata.name.as_deref().unwrap_or_default();
        debug!(build = %name, superseded_by = current, "cancelling superseded build");
        if let Err(err) = api.patch(namespace, name, &patch).await {
            if !err.is_not_found() {
                errors.push(Error::Api(err));
            }
        }
    }
    Error::aggregate(errors).map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_client::memory::{MemoryApi, Verb};
    use kiln_core::{labels, ErrorResponse, ObjectMeta};
    use kiln_runtime::{reflector::Writer, watcher};
    use std::collections::BTreeMap;

    fn build(number: i64, phase: BuildPhase, policy: RunPolicy) -> Build {
        let mut build = Build {
            metadata: ObjectMeta {
                name: Some(format!("ruby-{number}")),
                namespace: Some("app".into()),
                labels: Some(BTreeMap::from([
                    (labels::BUILD_CONFIG_LABEL.to_owned(), "ruby".to_owned()),
                    (labels::BUILD_RUN_POLICY_LABEL.to_owned(), policy.to_string()),
                ])),
                annotations: Some(BTreeMap::from([(
                    labels::BUILD_NUMBER_ANNOTATION.to_owned(),
                    number.to_string(),
                )])),
                ..ObjectMeta::default()
            },
            ..Build::default()
        };
        build.status.phase = phase;
        build
    }

    fn store(builds: Vec<Build>) -> Store<Build> {
        let mut writer = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Restarted(builds));
        writer.as_reader()
    }

    fn names(builds: &[Arc<Build>]) -> Vec<&str> {
        builds.iter().map(|b| b.metadata.name.as_deref().unwrap_or_default()).collect()
    }

    #[test]
    fn policy_lookup() {
        assert_eq!(Policy::for_build(&build(1, BuildPhase::New, RunPolicy::Parallel)), Policy::Parallel);
        assert_eq!(
            Policy::for_build(&build(1, BuildPhase::New, RunPolicy::SerialLatestOnly)),
            Policy::SerialLatestOnly
        );
        assert_eq!(Policy::for_build(&Build::default()), Policy::Serial);
        assert!(!Policy::Serial.handles(RunPolicy::SerialLatestOnly));
    }

    #[test]
    fn serial_batch_is_lowest_number() {
        let builds = store(vec![
            build(3, BuildPhase::New, RunPolicy::Serial),
            build(1, BuildPhase::New, RunPolicy::Serial),
            build(2, BuildPhase::New, RunPolicy::Parallel),
            build(0, BuildPhase::Complete, RunPolicy::Serial),
        ]);
        let (next, running) = get_next_config_build(&builds, "app", "ruby").unwrap();
        assert_eq!(names(&next), ["ruby-1"]);
        assert!(!running);
    }

    #[test]
    fn parallel_batch_takes_all_parallel_builds() {
        let builds = store(vec![
            build(4, BuildPhase::New, RunPolicy::Parallel),
            build(2, BuildPhase::New, RunPolicy::Parallel),
            build(3, BuildPhase::New, RunPolicy::Serial),
            build(1, BuildPhase::Running, RunPolicy::Serial),
        ]);
        let (next, running) = get_next_config_build(&builds, "app", "ruby").unwrap();
        assert_eq!(names(&next), ["ruby-2", "ruby-4"]);
        assert!(running);
    }

    #[test]
    fn missing_build_number_is_an_error() {
        let mut unnumbered = build(1, BuildPhase::New, RunPolicy::Serial);
        unnumbered.metadata.annotations = None;
        let builds = store(vec![unnumbered]);
        assert!(matches!(
            get_next_config_build(&builds, "app", "ruby"),
            Err(Error::Build(kiln_core::Error::MissingBuildNumber(_)))
        ));
    }

    #[test]
    fn running_serial_detection() {
        let builds = store(vec![
            build(1, BuildPhase::Running, RunPolicy::Parallel),
            build(2, BuildPhase::Complete, RunPolicy::Serial),
        ]);
        assert!(!has_running_serial_build(&builds, "app", "ruby"));
        let builds = store(vec![build(1, BuildPhase::Pending, RunPolicy::SerialLatestOnly)]);
        assert!(has_running_serial_build(&builds, "app", "ruby"));
        assert!(!has_running_serial_build(&builds, "app", "other"));
    }

    #[tokio::test]
    async fn builds_without_config_always_run() {
        let api = MemoryApi::<Build>::new();
        let mut lone = build(1, BuildPhase::New, RunPolicy::Serial);
        lone.metadata.labels = None;
        let builds = store(vec![build(1, BuildPhase::Running, RunPolicy::Serial)]);
        assert!(Policy::Serial.is_runnable(&lone, &builds, &api).await.unwrap());
    }

    #[tokio::test]
    async fn serial_waits_for_its_turn() {
        let api = MemoryApi::<Build>::new();
        let first = build(1, BuildPhase::New, RunPolicy::Serial);
        let second = build(2, BuildPhase::New, RunPolicy::Serial);
        let builds = store(vec![first.clone(), second.clone()]);
        assert!(Policy::Serial.is_runnable(&first, &builds, &api).await.unwrap());
        assert!(!Policy::Serial.is_runnable(&second, &builds, &api).await.unwrap());

        let builds = store(vec![build(0, BuildPhase::Running, RunPolicy::Serial), first.clone()]);
        assert!(!Policy::Serial.is_runnable(&first, &builds, &api).await.unwrap());
    }

    #[tokio::test]
    async fn parallel_waits_for_serial_builds_only() {
        let api = MemoryApi::<Build>::new();
        let candidate = build(3, BuildPhase::New, RunPolicy::Parallel);
        let builds = store(vec![build(1, BuildPhase::Running, RunPolicy::Parallel), candidate.clone()]);
        assert!(Policy::Parallel.is_runnable(&candidate, &builds, &api).await.unwrap());

        let builds = store(vec![build(1, BuildPhase::Running, RunPolicy::Serial), candidate.clone()]);
        assert!(!Policy::Parallel.is_runnable(&candidate, &builds, &api).await.unwrap());
    }

    #[tokio::test]
    async fn serial_latest_only_cancels_older_queued_builds() {
        let api = MemoryApi::<Build>::new();
        let queued = build(1, BuildPhase::New, RunPolicy::SerialLatestOnly);
        let pending = build(2, BuildPhase::Pending, RunPolicy::SerialLatestOnly);
        let running = build(3, BuildPhase::Running, RunPolicy::SerialLatestOnly);
        let latest = build(4, BuildPhase::New, RunPolicy::SerialLatestOnly);
        let newer = build(5, BuildPhase::New, RunPolicy::SerialLatestOnly);
        for b in [&queued, &pending, &running, &latest, &newer] {
            api.insert(b.clone());
        }
        let builds = store(vec![queued, pending, running, latest.clone(), newer]);

        let runnable = Policy::SerialLatestOnly
            .is_runnable(&latest, &builds, &api)
            .await
            .unwrap();
        assert!(!runnable, "a running build blocks the group");

        let patched: Vec<String> = api.calls_of(Verb::Patch).into_iter().map(|c| c.name).collect();
        assert_eq!(patched.len(), 2);
        assert!(patched.contains(&"ruby-1".to_string()));
        assert!(patched.contains(&"ruby-2".to_string()));
        assert!(api.stored("app", "ruby-1").unwrap().status.cancelled);
        assert!(!api.stored("app", "ruby-3").unwrap().status.cancelled);
        assert!(!api.stored("app", "ruby-5").unwrap().status.cancelled);
    }

    #[tokio::test]
    async fn cancellation_failures_are_reported() {
        let api = MemoryApi::<Build>::new();
        let older = build(1, BuildPhase::New, RunPolicy::SerialLatestOnly);
        let latest = build(2, BuildPhase::New, RunPolicy::SerialLatestOnly);
        api.insert(older.clone());
        api.fail_next(Verb::Patch, ErrorResponse::internal("etcd unavailable"));
        let builds = store(vec![older, latest.clone()]);
        let err = Policy::SerialLatestOnly
            .is_runnable(&latest, &builds, &api)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }
}
