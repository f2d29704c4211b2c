//! Typed read/write/list/watch façade over a versioned record store
//! (spec.md §4.A). Records with a stale `resourceVersion` are rejected with
//! `ControlPlaneError::Conflict`; callers recover by re-reading and
//! re-applying their mutation under a bounded exponential-backoff retry
//! (`with_retry`), mirroring the teacher's typed-service-over-storage shape
//! in `registry::service`.

mod adapter;
mod retry;

pub use adapter::{HasMeta, InMemoryStore, ListOptions, ObjectStore, WatchEvent};
pub use retry::with_retry;
