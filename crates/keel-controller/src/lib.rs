//! Keel reconciliation kernel
//!
//! The building blocks every Keel controller is assembled from:
//! - [`queue`] and [`runner`]: deduplicating rate-limited work queue and the
//!   worker pool that drains it into a [`runner::Reconciler`]
//! - [`source`] and [`handlers`]: informer notifications routed to queue keys
//! - [`claim`]: adoption and release of children through controller references
//! - [`apply`] and [`digest`]: create-or-update guarded by a digest annotation
//! - [`prune`]: UID-pinned deletion of children that are no longer desired
//! - [`status`]: Available/Progressing/Degraded condition aggregation
//!
//! Remote access goes through small per-kind traits implemented over kube-rs
//! in [`kube_control`] and in memory by `fake` (feature `testing`).

#![deny(missing_docs)]

pub mod apply;
pub mod claim;
pub mod digest;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod handlers;
pub mod kube_control;
pub mod lister;
pub mod object;
pub mod prune;
pub mod queue;
pub mod rate_limiter;
pub mod runner;
pub mod source;
pub mod status;

pub use apply::{Applier, ApplyControl, ApplyOptions, ApplyOutcome};
pub use claim::{get_objects, get_objects_with_filter, ClaimControl, ControllerRefManager};
pub use digest::DigestConfig;
pub use handlers::{HandlerOperation, Handlers, Notification};
pub use kube_control::{KubeClaimControl, KubeControl, NamespacedObject};
pub use lister::ObjectLister;
pub use object::{ControllerIdentity, ObjectKey};
pub use prune::{PruneControl, Pruner};
pub use queue::WorkQueue;
pub use runner::{Controller, Reconciler, SyncContext};
pub use kube::core::{Selector, SelectorExt};
pub use status::StatusControl;
