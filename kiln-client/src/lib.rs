//! Object store access for the kiln build controller
//!
//! The controller reads almost everything from watch-fed caches and only writes (and
//! occasionally reads uncached) through the [`Api`] trait defined here. Transport
//! implementations live outside this workspace; [`memory::MemoryApi`] is an in-process
//! store behind the `memory` feature.
#![deny(unsafe_code)]

pub mod api;
pub use api::Api;

pub mod error;
pub use error::Error;

#[cfg(feature = "memory")]
pub mod memory;

pub use kiln_core::{Patch, Resource, ResourceExt};

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
