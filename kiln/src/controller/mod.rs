//! The build controller
//!
//! A [`BuildController`] owns three work queues:
//!
//! - the build queue, keyed by build `namespace/name`, drives each build through its
//!   phases (pod creation, status tracking, finalization);
//! - the build group queue, keyed by build config `namespace/name`, decides which
//!   queued builds of a group may start once another one finished;
//! - the config queue, with the single key [`CONFIG_KEY`], re-reads the cluster wide
//!   build settings.
//!
//! Keys are fed by the cache event handlers. Workers always re-read the current state
//! from the caches instead of trusting the event that enqueued a key.
use std::{future::Future, sync::Arc};

use futures::{future, stream::BoxStream, StreamExt};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Pod, Secret, ServiceAccount},
    events::v1::Event,
};
use kiln_client::Api;
use kiln_core::{
    Build, BuildConfig, ClusterBuildConfig, ClusterImageConfig, ImageStream, Resource, ResourceExt,
};
use kiln_runtime::{
    events::{NewEvent, Recorder},
    reflector::{Change, ObjectRef, Writer},
    reflector, watcher, ResourceTriggerQueue, Store, WorkQueue,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    cluster_config::{ClusterConfig, CONFIG_KEY},
    policy,
    secrets::SecretLookup,
    strategy::{PodFactory, TypeBasedFactory},
    Config, Error, Result,
};

mod handlers;
mod images;
mod pod;
mod reconcile;
mod update;


/// Write access to the object store
pub struct Clients {
    pub builds: Arc<dyn Api<Build>>,
    pub pods: Arc<dyn Api<Pod>>,
    pub config_maps: Arc<dyn Api<ConfigMap>>,
    pub events: Arc<dyn Api<Event>>,
}

/// The caches the controller reads from
#[derive(Clone)]
pub struct Stores {
    pub builds: Store<Build>,
    pub build_configs: Store<BuildConfig>,
    pub pods: Store<Pod>,
    pub secrets: Store<Secret>,
    pub service_accounts: Store<ServiceAccount>,
    pub image_streams: Store<ImageStream>,
    /// ConfigMaps of `openshift-config` and `openshift-controller-manager`
    pub config_maps: Store<ConfigMap>,
    pub cluster_builds: Store<ClusterBuildConfig>,
    pub cluster_images: Store<ClusterImageConfig>,
}

/// The writing halves of [`Stores`]
///
/// Handed to [`BuildController::run`], which feeds them from the [`Informers`].
#[derive(Default)]
pub struct Writers {
    pub builds: Writer<Build>,
    pub build_configs: Writer<BuildConfig>,
    pub pods: Writer<Pod>,
    pub secrets: Writer<Secret>,
    pub service_accounts: Writer<ServiceAccount>,
    pub image_streams: Writer<ImageStream>,
    pub config_maps: Writer<ConfigMap>,
    pub cluster_builds: Writer<ClusterBuildConfig>,
    pub cluster_images: Writer<ClusterImageConfig>,
}

impl Writers {
    pub fn stores(&self) -> Stores {
        Stores {
            builds: self.builds.as_reader(),
            build_configs: self.build_configs.as_reader(),
            pods: self.pods.as_reader(),
            secrets: self.secrets.as_reader(),
            service_accounts: self.service_accounts.as_reader(),
            image_streams: self.image_streams.as_reader(),
            config_maps: self.config_maps.as_reader(),
            cluster_builds: self.cluster_builds.as_reader(),
            cluster_images: self.cluster_images.as_reader(),
        }
    }
}

/// Watch event streams, one per cached type
pub struct Informers {
    pub builds: BoxStream<'static, watcher::Event<Build>>,
    pub build_configs: BoxStream<'static, watcher::Event<BuildConfig>>,
    pub pods: BoxStream<'static, watcher::Event<Pod>>,
    pub secrets: BoxStream<'static, watcher::Event<Secret>>,
    pub service_accounts: BoxStream<'static, watcher::Event<ServiceAccount>>,
    pub image_streams: BoxStream<'static, watcher::Event<ImageStream>>,
    pub config_maps: BoxStream<'static, watcher::Event<ConfigMap>>,
    pub cluster_builds: BoxStream<'static, watcher::Event<ClusterBuildConfig>>,
    pub cluster_images: BoxStream<'static, watcher::Event<ClusterImageConfig>>,
}

/// Drives builds from `New` to a terminal phase
pub struct BuildController {
    config: Config,
    clients: Clients,
    stores: Stores,
    secrets: SecretLookup,
    pod_factory: Arc<dyn PodFactory>,
    recorder: Recorder,
    cluster_config: ClusterConfig,
    build_queue: WorkQueue<String>,
    group_queue: WorkQueue<String>,
    config_queue: WorkQueue<String>,
    image_stream_triggers: ResourceTriggerQueue,
}

impl BuildController {
    /// A controller creating pods through a [`TypeBasedFactory`] running `config.builder_image`
    pub fn new(config: Config, clients: Clients, stores: Stores) -> Self {
        let recorder = Recorder::new(clients.events.clone(), config.reporter());
        let secrets = SecretLookup {
            service_accounts: stores.service_accounts.clone(),
            secrets: stores.secrets.clone(),
        };
        Self {
            pod_factory: Arc::new(TypeBasedFactory::new(config.builder_image.clone())),
            build_queue: WorkQueue::with_rate_limiter("build", config.rate_limiter()),
            group_queue: WorkQueue::with_rate_limiter("build-config", config.rate_limiter()),
            config_queue: WorkQueue::new("controller-config"),
            image_stream_triggers: ResourceTriggerQueue::new(),
            cluster_config: ClusterConfig::new(),
            config,
            clients,
            stores,
            secrets,
            recorder,
        }
    }

    /// Replaces the pod factory
    #[must_use]
    pub fn with_pod_factory(mut self, factory: Arc<dyn PodFactory>) -> Self {
        self.pod_factory = factory;
        self
    }

    /// The cluster wide build settings as last synced
    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.cluster_config
    }

    /// Runs the controller until `shutdown` resolves
    ///
    /// Feeds `writers` from `informers`, waits for every cache to be populated, syncs the
    /// cluster config once and then starts the worker pools. On shutdown no new keys are
    /// picked up, but keys already being processed run to completion before this returns.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::CacheSync`] when an informer ends before its initial list.
    pub async fn run(
        self: Arc<Self>,
        writers: Writers,
        informers: Informers,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let reflectors = self.clone().spawn_reflectors(writers, informers);
        tokio::pin!(shutdown);

        let stores = &self.stores;
        let synced = async {
            futures::try_join!(
                stores.builds.wait_until_ready(),
                stores.build_configs.wait_until_ready(),
                stores.pods.wait_until_ready(),
                stores.secrets.wait_until_ready(),
                stores.service_accounts.wait_until_ready(),
                stores.image_streams.wait_until_ready(),
                stores.config_maps.wait_until_ready(),
                stores.cluster_builds.wait_until_ready(),
                stores.cluster_images.wait_until_ready(),
            )
        };
        let synced = tokio::select! {
            res = synced => Some(res),
            () = &mut shutdown => None,
        };
        match synced {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                self.shut_down_queues();
                abort_all(&reflectors);
                return Err(err.into());
            }
            None => {
                info!("shutdown requested before caches synced");
                self.shut_down_queues();
                abort_all(&reflectors);
                return Ok(());
            }
        }

        if let Err(err) = self.sync_cluster_config() {
            error!(%err, "failed to sync build controller config");
        }

        info!(workers = self.config.workers, "starting build controller");
        let mut workers = vec![tokio::spawn(self.clone().config_worker())];
        for _ in 0..self.config.workers {
            workers.push(tokio::spawn(self.clone().build_worker()));
            workers.push(tokio::spawn(self.clone().group_worker()));
        }

        shutdown.await;
        info!("shutting down build controller");
        self.shut_down_queues();
        for res in future::join_all(workers).await {
            if let Err(err) = res {
                error!(%err, "worker task failed");
            }
        }
        abort_all(&reflectors);
        Ok(())
    }

    fn spawn_reflectors(self: Arc<Self>, writers: Writers, informers: Informers) -> Vec<JoinHandle<()>> {
        vec![
            spawn_reflector(writers.builds, informers.builds, {
                let this = self.clone();
                move |change: &Change<Build>| this.on_build(change)
            }),
            spawn_reflector(writers.build_configs, informers.build_configs, |_| {}),
            spawn_reflector(writers.pods, informers.pods, {
                let this = self.clone();
                move |change: &Change<Pod>| this.on_pod(change)
            }),
            spawn_reflector(writers.secrets, informers.secrets, |_| {}),
            spawn_reflector(writers.service_accounts, informers.service_accounts, |_| {}),
            spawn_reflector(writers.image_streams, informers.image_streams, {
                let this = self.clone();
                move |change: &Change<ImageStream>| this.on_image_stream(change)
            }),
            spawn_reflector(writers.config_maps, informers.config_maps, {
                let this = self.clone();
                move |change: &Change<ConfigMap>| this.on_config_map(change)
            }),
            spawn_reflector(writers.cluster_builds, informers.cluster_builds, {
                let this = self.clone();
                move |change: &Change<ClusterBuildConfig>| this.on_cluster_build_config(change)
            }),
            spawn_reflector(writers.cluster_images, informers.cluster_images, {
                let this = self.clone();
                move |change: &Change<ClusterImageConfig>| this.on_cluster_image_config(change)
            }),
        ]
    }

    fn shut_down_queues(&self) {
        self.build_queue.shut_down();
        self.group_queue.shut_down();
        self.config_queue.shut_down();
    }

    async fn build_worker(self: Arc<Self>) {
        while let Some(key) = self.build_queue.get().await {
            let result = self
                .sync_build(&key)
                .instrument(info_span!("build", build = %key))
                .await;
            self.handle_build_error(&key, result);
            self.build_queue.done(&key);
        }
    }

    async fn sync_build(&self, key: &str) -> Result<()> {
        let obj_ref: ObjectRef = key.parse().map_err(|_| Error::InvalidKey(key.to_owned()))?;
        match self.stores.builds.get(&obj_ref) {
            Some(build) => self.handle_build(&build).await,
            None => {
                debug!("build no longer exists");
                Ok(())
            }
        }
    }

    fn handle_build_error(&self, key: &str, result: Result<()>) {
        let key = key.to_owned();
        let err = match result {
            Ok(()) => {
                self.build_queue.forget(&key);
                return;
            }
            Err(err) => err,
        };
        if err.is_fatal() {
            error!(build = %key, %err, "will not retry fatal error");
            self.build_queue.forget(&key);
        } else if self.build_queue.num_requeues(&key) < self.config.max_retries {
            debug!(build = %key, %err, "failed to handle build, retrying");
            self.build_queue.add_rate_limited(key);
        } else {
            warn!(build = %key, %err, "giving up retrying build");
            self.build_queue.forget(&key);
        }
    }

    async fn group_worker(self: Arc<Self>) {
        while let Some(key) = self.group_queue.get().await {
            let result = self
                .sync_build_config(&key)
                .instrument(info_span!("build_config", build_config = %key))
                .await;
            self.handle_build_config_error(&key, result);
            self.group_queue.done(&key);
        }
    }

    async fn sync_build_config(&self, key: &str) -> Result<()> {
        let (namespace, name) = key
            .split_once('/')
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
            .ok_or_else(|| Error::InvalidKey(key.to_owned()))?;
        self.handle_build_config(namespace, name)
    }

    /// Enqueues the builds of a group that may start next
    fn handle_build_config(&self, namespace: &str, name: &str) -> Result<()> {
        let (next, has_running) = policy::get_next_config_build(&self.stores.builds, namespace, name)?;
        let key = format!("{namespace}/{name}");
        if has_running {
            return Err(Error::HasRunningBuilds(key));
        }
        if next.is_empty() {
            return Err(Error::NoBuildsToRun(key));
        }
        for build in next {
            debug!(build = %build.key(), "queuing next build");
            self.build_queue.add(build.key());
        }
        Ok(())
    }

    fn handle_build_config_error(&self, key: &str, result: Result<()>) {
        let key = key.to_owned();
        match result {
            Ok(()) => self.group_queue.forget(&key),
            Err(err) if err.is_fatal() => {
                error!(build_config = %key, %err, "will not retry fatal error");
                self.group_queue.forget(&key);
            }
            Err(err) if self.group_queue.num_requeues(&key) < self.config.max_retries => {
                debug!(build_config = %key, %err, "failed to handle build config, retrying");
                self.group_queue.add_rate_limited(key);
            }
            Err(err) => {
                warn!(build_config = %key, %err, "giving up retrying build config");
                self.group_queue.forget(&key);
            }
        }
    }

    async fn config_worker(self: Arc<Self>) {
        while let Some(key) = self.config_queue.get().await {
            if let Err(err) = self.sync_cluster_config() {
                error!(%err, "failed to sync build controller config");
            }
            self.config_queue.forget(&key);
            self.config_queue.done(&key);
        }
    }

    fn sync_cluster_config(&self) -> Result<()> {
        self.cluster_config.sync(
            &self.stores.cluster_builds,
            &self.stores.cluster_images,
            &self.stores.config_maps,
        )
    }

    /// Publishes an event about `build`, logging instead of failing
    async fn record(&self, build: &Build, event: NewEvent) {
        if let Err(err) = self.recorder.publish(&build.object_ref(), event).await {
            warn!(build = %build.key(), %err, "failed to publish event");
        }
    }
}

fn spawn_reflector<K>(
    writer: Writer<K>,
    events: BoxStream<'static, watcher::Event<K>>,
    handler: impl Fn(&Change<K>) + Send + 'static,
) -> JoinHandle<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    tokio::spawn(reflector(writer, events).for_each(move |change| {
        handler(&change);
        future::ready(())
    }))
}

fn abort_all(handles: &[JoinHandle<()>]) {
    for handle in handles {
        handle.abort();
    }
}
