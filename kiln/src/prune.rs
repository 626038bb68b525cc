//! History limit pruning of finished builds
use std::sync::Arc;

use kiln_client::{api::delete_ignore_missing, Api};
use kiln_core::{Build, BuildConfig, BuildPhase, ResourceExt};
use kiln_runtime::Store;
use tracing::debug;

use crate::{policy::config_builds, Error, Result};

/// Deletes finished builds of `config` beyond its history limits
///
/// Newer builds are kept. A build config that is no longer cached has nothing to prune.
pub async fn prune_builds(
    namespace: &str,
    config: &str,
    builds: &Store<Build>,
    configs: &Store<BuildConfig>,
    api: &dyn Api<Build>,
) -> Result<()> {
    let Some(build_config) = configs.get_namespaced(namespace, config) else {
        debug!(%namespace, %config, "build config not cached, skipping pruning");
        return Ok(());
    };

    let mut doomed = Vec::new();
    if let Some(limit) = build_config.spec.successful_builds_history_limit {
        doomed.extend(beyond_limit(
            config_builds(builds, namespace, config, |b| b.phase() == BuildPhase::Complete),
            limit,
        ));
    }
    if let Some(limit) = build_config.spec.failed_builds_history_limit {
        doomed.extend(beyond_limit(
            config_builds(builds, namespace, config, |b| {
                matches!(b.phase(), BuildPhase::Failed | BuildPhase::Error | BuildPhase::Cancelled)
            }),
            limit,
        ));
    }

    let mut errors = Vec::new();
    for build in doomed {
        let name = build.name_any();
        debug!(%namespace, build = %name, "pruning build");
        if let Err(err) = delete_ignore_missing(api, namespace, &name).await {
            errors.push(Error::Api(err));
        }
    }
    Error::aggregate(errors).map_or(Ok(()), Err)
}

/// The builds past the newest `limit`
fn beyond_limit(mut builds: Vec<Arc<Build>>, limit: i32) -> Vec<Arc<Build>> {
    builds.sort_by(|a, b| {
        b.creation_timestamp()
            .cmp(&a.creation_timestamp())
            .then_with(|| b.metadata.name.cmp(&a.metadata.name))
    });
    let keep = usize::try_from(limit).unwrap_or(0);
    builds.into_iter().skip(keep).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::{TimeZone, Utc},
    };
    use kiln_client::memory::{MemoryApi, Verb};
    use kiln_core::{build_config::BuildConfigSpec, labels, ErrorResponse, ObjectMeta};
    use kiln_runtime::{reflector::Writer, watcher};
    use std::collections::BTreeMap;

    fn build(n: i64, phase: BuildPhase) -> Build {
        let mut build = Build::default();
        build.metadata = ObjectMeta {
            name: Some(format!("ruby-{n}")),
            namespace: Some("app".into()),
            creation_timestamp: Some(Time(Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap())),
            labels: Some(BTreeMap::from([(labels::BUILD_CONFIG_LABEL.to_owned(), "ruby".to_owned())])),
            ..ObjectMeta::default()
        };
        build.status.phase = phase;
        build
    }

    fn stores(builds: Vec<Build>, spec: Option<BuildConfigSpec>) -> (Store<Build>, Store<BuildConfig>) {
        let mut build_w = Writer::default();
        build_w.apply_watcher_event(&watcher::Event::Restarted(builds));
        let mut config_w = Writer::default();
        let configs = spec
            .map(|spec| BuildConfig {
                metadata: ObjectMeta {
                    name: Some("ruby".into()),
                    namespace: Some("app".into()),
                    ..ObjectMeta::default()
                },
                spec,
                ..BuildConfig::default()
            })
            .into_iter()
            .collect();
        config_w.apply_watcher_event(&watcher::Event::Restarted(configs));
        (build_w.as_reader(), config_w.as_reader())
    }

    fn deleted(api: &MemoryApi<Build>) -> Vec<String> {
        let mut names: Vec<String> = api.calls_of(Verb::Delete).into_iter().map(|c| c.name).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn keeps_newest_builds_per_outcome() {
        let all = vec![
            build(1, BuildPhase::Complete),
            build(2, BuildPhase::Failed),
            build(3, BuildPhase::Complete),
            build(4, BuildPhase::Cancelled),
            build(5, BuildPhase::Error),
            build(6, BuildPhase::Complete),
            build(7, BuildPhase::Running),
        ];
        let api = MemoryApi::new();
        for b in &all {
            api.insert(b.clone());
        }
        let (builds, configs) = stores(
            all,
            Some(BuildConfigSpec {
                successful_builds_history_limit: Some(2),
                failed_builds_history_limit: Some(1),
                ..BuildConfigSpec::default()
            }),
        );
        prune_builds("app", "ruby", &builds, &configs, &api).await.unwrap();
        assert_eq!(deleted(&api), ["ruby-1", "ruby-2", "ruby-4"]);
        assert!(api.stored("app", "ruby-7").is_some());
    }

    #[tokio::test]
    async fn unlimited_or_unknown_config_prunes_nothing() {
        let api = MemoryApi::new();
        let (builds, configs) = stores(
            vec![build(1, BuildPhase::Complete)],
            Some(BuildConfigSpec::default()),
        );
        prune_builds("app", "ruby", &builds, &configs, &api).await.unwrap();
        let (builds, configs) = stores(vec![build(1, BuildPhase::Complete)], None);
        prune_builds("app", "ruby", &builds, &configs, &api).await.unwrap();
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_builds_are_tolerated_and_errors_collected() {
        let api = MemoryApi::new();
        api.insert(build(2, BuildPhase::Failed));
        api.fail_next(Verb::Delete, ErrorResponse::internal("etcd unavailable"));
        let (builds, configs) = stores(
            vec![build(1, BuildPhase::Failed), build(2, BuildPhase::Failed), build(3, BuildPhase::Failed)],
            Some(BuildConfigSpec {
                failed_builds_history_limit: Some(0),
                ..BuildConfigSpec::default()
            }),
        );
        let err = prune_builds("app", "ruby", &builds, &configs, &api).await.unwrap_err();
        assert!(matches!(err, Error::Api(_)), "only the injected failure is reported: {err}");
        assert_eq!(api.calls_of(Verb::Delete).len(), 3);
    }
}
