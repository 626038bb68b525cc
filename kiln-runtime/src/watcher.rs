//! Watch events delivered to [`reflector`](crate::reflector) caches
//!
//! The watch transport itself lives outside this workspace. It is expected to deliver a
//! `Restarted` event with the full listing first, then `Applied`/`Deleted` changes, and
//! to emit `Restarted` again whenever it has to relist.

/// A change observed by a watch
#[derive(Debug, Clone, PartialEq)]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the watcher is unavailable. Use finalizers instead.
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    Restarted(Vec<K>),
}
