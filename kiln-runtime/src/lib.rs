//! Runtime plumbing for the kiln build controller
//!
//! This crate contains the pieces a controller is assembled from:
//!
//! - [`WorkQueue`]: a deduplicating, rate limited queue of object keys
//! - [`ResourceTriggerQueue`]: an index of keys waiting on other objects
//! - [`reflector`]: watch-fed object caches
//! - [`events`]: publishing of `events.k8s.io` events
#![deny(unsafe_code)]

pub mod events;
pub mod reflector;
pub mod trigger;
pub mod watcher;
pub mod workqueue;

pub use reflector::{reflector, Store};
pub use trigger::ResourceTriggerQueue;
pub use workqueue::WorkQueue;
