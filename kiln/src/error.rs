//! Error handling in [`kiln`][crate]
use thiserror::Error;

use crate::strategy::StrategyError;

/// Possible errors while reconciling builds and the controller configuration
#[derive(Error, Debug)]
pub enum Error {
    /// A call to the object store failed
    #[error("api request failed: {0}")]
    Api(#[from] kiln_client::Error),

    /// A build object could not be interpreted or changed
    #[error(transparent)]
    Build(#[from] kiln_core::Error),

    /// A cache lost its writer before it was populated
    #[error("failed to sync caches: {0}")]
    CacheSync(#[from] kiln_runtime::reflector::WriterDropped),

    /// A work queue key was not `namespace/name`
    #[error("invalid key {0:?}")]
    InvalidKey(String),

    /// The pod of a cancelled build could not be removed
    #[error("could not delete build pod {namespace}/{pod} to cancel build: {source}")]
    CancelBuild {
        namespace: String,
        pod: String,
        #[source]
        source: kiln_client::Error,
    },

    #[error("one or more image references were invalid")]
    InvalidImageReferences,

    #[error("the integrated registry is not configured")]
    NoIntegratedRegistry,

    #[error("image stream {namespace}/{name} not found")]
    ImageStreamNotFound { namespace: String, name: String },

    #[error("the referenced image stream tag {namespace}/{name} does not exist")]
    ImageStreamTagNotFound { namespace: String, name: String },

    #[error("no image in {namespace}/{stream} matches {image:?}")]
    ImageNotFound {
        namespace: String,
        stream: String,
        image: String,
    },

    #[error("multiple images match the prefix {image:?}: {matches}")]
    AmbiguousImage { image: String, matches: String },

    #[error("the referenced image stream image {namespace}/{name} does not have a pull spec")]
    MissingPullSpec { namespace: String, name: String },

    #[error("service account {namespace}/{name} not found")]
    ServiceAccountNotFound { namespace: String, name: String },

    #[error("no docker secrets associated with build service account {namespace}/{name}")]
    NoDockerSecrets { namespace: String, name: String },

    /// The pod factory refused the build
    #[error("failed to create a build pod spec for build {build}: {source}")]
    PodSpec {
        build: String,
        #[source]
        source: StrategyError,
    },

    #[error("failed to create build pod: {0}")]
    CreatePod(#[source] kiln_client::Error),

    #[error("failed to create build certificate authority configMap: {0}")]
    CreateCaConfigMap(#[source] kiln_client::Error),

    #[error("failed to create build system config configMap: {0}")]
    CreateSystemConfigMap(#[source] kiln_client::Error),

    #[error("configMap {namespace}/{name} is not owned by build pod {namespace}/{pod}")]
    ConfigMapNotOwned {
        namespace: String,
        name: String,
        pod: String,
    },

    #[error("build config {0} has running builds and cannot run more builds")]
    HasRunningBuilds(String),

    #[error("build config {0} has no builds to run next")]
    NoBuildsToRun(String),

    #[error("invalid registries config: only one of allowedRegistries or blockedRegistries may be specified")]
    ConflictingRegistrySources,

    #[error("failed to render registries.conf: {0}")]
    RegistriesConf(#[from] toml::ser::Error),

    #[error("failed to render policy.json: {0}")]
    SignaturePolicy(#[source] serde_json::Error),

    /// Several independent operations failed
    #[error("{}", join(.0))]
    Multiple(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
    let msgs: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("[{}]", msgs.join(", "))
}

impl Error {
    /// Errors that retrying cannot fix
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::InvalidKey(_) => true,
            Error::PodSpec { source, .. } => source.is_fatal(),
            Error::Multiple(errors) => errors.iter().any(Error::is_fatal),
            _ => false,
        }
    }

    /// Whether this, or any aggregated error, reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Api(e) => e.is_not_found(),
            Error::ImageStreamNotFound { .. }
            | Error::ImageStreamTagNotFound { .. }
            | Error::ImageNotFound { .. } => true,
            Error::Multiple(errors) => errors.iter().any(Error::is_not_found),
            _ => false,
        }
    }

    /// Collapses `errors` into one, `None` when empty
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }
}
