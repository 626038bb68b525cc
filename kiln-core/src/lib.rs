//! Types and traits shared by the kiln build controller
//!
//! This crate holds the resource model (builds, build configs, image streams and the
//! cluster configuration singletons), the build phase state machine and the
//! [`BuildUpdate`] accumulator. It performs no I/O.
#![deny(unsafe_code)]

#[macro_use]
mod macros;

pub mod build;
pub use build::{Build, BuildPhase, BuildSpec, BuildStatus, StatusReason};

pub mod build_config;
pub use build_config::{BuildConfig, RunPolicy};

pub mod cluster;
pub use cluster::{ClusterBuildConfig, ClusterImageConfig};

pub mod image;
pub use image::ImageStream;

pub mod labels;

pub mod naming;

pub mod params;
pub use params::Patch;

mod resource;
pub use resource::{Resource, ResourceExt};

pub mod update;
pub use update::BuildUpdate;

mod error;
pub use error::{Error, ErrorResponse};

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
