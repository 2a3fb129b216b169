//! Common types for Keel: CRDs, conditions, errors, events and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod telemetry;

pub use config::ControllerConfig;
pub use crd::{Condition, ConditionStatus};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager / reporting component name used for writes and events
pub const OPERATOR_NAME: &str = "keel-operator";

/// Annotation carrying the digest of the desired state last applied to an object
pub const MANAGED_HASH_ANNOTATION: &str = "internal.keel.dev/managed-hash";

/// Standard label marking objects managed by Keel
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on objects managed by Keel
pub const MANAGED_BY_VALUE: &str = "keel";

/// Label linking a child object to the MaintenanceTask that owns it
pub const MAINTENANCE_TASK_NAME_LABEL: &str = "keel.dev/maintenance-task-name";
