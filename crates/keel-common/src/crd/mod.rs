//! Custom Resource Definitions for Keel
//!
//! This module contains the CRD definitions and shared status types used by
//! Keel controllers.

mod task;
mod types;

pub use task::{MaintenanceTask, MaintenanceTaskSpec, MaintenanceTaskStatus};
pub use types::{Condition, ConditionStatus};
