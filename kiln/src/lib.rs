//! Kiln drives the lifecycle of builds: jobs that turn source into an image inside a pod.
//!
//! # Overview
//!
//! A build is created in the `New` phase by someone else. The [`BuildController`] decides
//! when it may start according to the run policy of its build config, resolves the images
//! and secrets it needs, creates its pod and tracks the pod until the build reaches one of
//! the terminal phases `Complete`, `Failed`, `Error` or `Cancelled`.
//!
//! The main modules are:
//!
//! - [`controller`] with the [`BuildController`] and its worker pools
//! - [`policy`] with the run policies deciding which builds of a group may start
//! - [`strategy`] with the [`PodFactory`](strategy::PodFactory) describing build pods
//! - [`cluster_config`] for cluster wide build defaults, overrides and registry settings
//! - [`prune`] for history limits of finished builds
//! - [`config`] for the controller's own [`Config`]
//!
//! The resource model lives in [`kiln_core`], object store access in [`kiln_client`] and
//! the queues and caches in [`kiln_runtime`].
//!
//! # Running the controller
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln::{controller::{Clients, Informers, Writers}, BuildController, Config};
//!
//! async fn run(clients: Clients, informers: Informers) -> Result<(), Box<dyn std::error::Error>> {
//!     let writers = Writers::default();
//!     let controller = Arc::new(BuildController::new(Config::from_env()?, clients, writers.stores()));
//!     controller
//!         .run(writers, informers, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
#![forbid(unsafe_code)]

pub mod cluster_config;
pub mod config;
pub mod controller;
pub mod policy;
pub mod prune;
pub mod secrets;
pub mod strategy;

mod error;

pub use config::Config;
pub use controller::BuildController;
pub use error::Error;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
