//! Mapping of cache changes to work queue keys
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kiln_core::{
    cluster::{CLUSTER_CONFIG_NAME, OPENSHIFT_CONFIG_NAMESPACE},
    labels::BUILD_ANNOTATION,
    Build, ClusterBuildConfig, ClusterImageConfig, ImageStream, ResourceExt,
};
use kiln_runtime::reflector::{Change, ObjectRef};
use tracing::trace;

use super::BuildController;
use crate::cluster_config::CONFIG_KEY;

impl BuildController {
    pub(crate) fn on_build(&self, change: &Change<Build>) {
        match change {
            Change::Added(build) | Change::Updated { new: build, .. } => self.build_queue.add(build.key()),
            Change::Deleted(build) => {
                if build.phase().is_terminal() {
                    return;
                }
                if let (Some(namespace), Some(config)) = (build.namespace(), build.config_name()) {
                    trace!(build = %build.key(), "active build deleted, re-evaluating its group");
                    self.group_queue.add(format!("{namespace}/{config}"));
                }
            }
        }
    }

    pub(crate) fn on_pod(&self, change: &Change<Pod>) {
        let pod = match change {
            Change::Added(_) => return,
            Change::Updated { old, new } => {
                if old.resource_version() == new.resource_version() {
                    return;
                }
                new
            }
            Change::Deleted(pod) => pod,
        };
        let build = pod.annotations().get(BUILD_ANNOTATION).filter(|name| !name.is_empty());
        if let (Some(namespace), Some(build)) = (pod.namespace(), build) {
            self.build_queue.add(format!("{namespace}/{build}"));
        }
    }

    pub(crate) fn on_image_stream(&self, change: &Change<ImageStream>) {
        if let Change::Deleted(_) = change {
            return;
        }
        for build in self.image_stream_triggers.pop(&change.object().key()) {
            trace!(%build, "image stream changed, queuing waiting build");
            self.build_queue.add(build);
        }
    }

    pub(crate) fn on_cluster_build_config(&self, _change: &Change<ClusterBuildConfig>) {
        self.config_queue.add(CONFIG_KEY.to_owned());
    }

    pub(crate) fn on_cluster_image_config(&self, _change: &Change<ClusterImageConfig>) {
        self.config_queue.add(CONFIG_KEY.to_owned());
    }

    /// Only the ConfigMap named as additional trusted CA by the image config is of interest
    pub(crate) fn on_config_map(&self, change: &Change<ConfigMap>) {
        let config_map = change.object();
        if config_map.namespace().as_deref() != Some(OPENSHIFT_CONFIG_NAMESPACE) {
            return;
        }
        let trusted_ca = self
            .stores
            .cluster_images
            .get(&ObjectRef::new(CLUSTER_CONFIG_NAME))
            .map(|config| config.spec.additional_trusted_ca.name.clone())
            .unwrap_or_default();
        if !trusted_ca.is_empty() && config_map.name_any() == trusted_ca {
            self.config_queue.add(CONFIG_KEY.to_owned());
        }
    }
}
