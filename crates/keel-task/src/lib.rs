//! MaintenanceTask controller
//!
//! Runs each `MaintenanceTask` as a Job the task owns, built on the Keel
//! reconciliation kernel:
//! - Job ownership through controller references
//! - Digest-guarded apply and UID-pinned prune of the Job
//! - Available/Progressing/Degraded conditions aggregated from the Job controller

pub mod controller;
pub mod informers;
pub mod resource;
pub mod status;

pub use controller::{TaskContext, TaskReconciler, CONTROLLER_NAME};
pub use informers::run;
