//! Roll-up of per-component status conditions
//!
//! Every sync stage contributes conditions named `<Component><Aggregate>`,
//! e.g. `JobControllerProgressing`. The aggregate conditions `Available`,
//! `Progressing` and `Degraded` summarize all contributions for the current
//! generation:
//!
//! - `Progressing` / `Degraded` are True when any contribution is True
//! - `Available` is False when any contribution is False
//!
//! Contributions computed for another generation are stale and ignored.

use std::future::Future;

use async_trait::async_trait;
use chrono::Utc;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::debug;

use keel_common::{Condition, ConditionStatus, Error};

use crate::object::ObjectKey;

/// Writes the status subresource of a controller object
///
/// Status is never written by the apply engine; controllers call this once
/// per sync, and only when the computed status differs from the cached one.
#[async_trait]
pub trait StatusControl: Send + Sync {
    /// Replace the status of `key` with `status`
    ///
    /// With `resource_version` set the write fails with a Conflict when the
    /// object changed since that version was read.
    async fn update_status(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
        status: &Value,
    ) -> keel_common::Result<()>;
}

/// Aggregate condition type: the workload serves as requested
pub const AVAILABLE: &str = "Available";
/// Aggregate condition type: the workload is converging
pub const PROGRESSING: &str = "Progressing";
/// Aggregate condition type: the workload hit an error
pub const DEGRADED: &str = "Degraded";

/// Reason used when nothing noteworthy is happening
pub const AS_EXPECTED_REASON: &str = "AsExpected";
/// Reason used for conditions derived from a sync error
pub const ERROR_REASON: &str = "Error";
/// Reason used while waiting for a written object to roll out
pub const PROGRESSING_REASON: &str = "Progressing";

/// Fold `conditions` into one condition of the kind named by `default`
///
/// The aggregate kind is taken from the suffix of `default.type_`. Conditions
/// whose `observed_generation` differs from `default`'s are ignored; when no
/// decisive condition remains, `default` is returned unchanged.
pub fn aggregate_status_conditions(
    conditions: &[Condition],
    default: Condition,
) -> keel_common::Result<Condition> {
    let decisive = if default.type_.ends_with(AVAILABLE) {
        ConditionStatus::False
    } else if default.type_.ends_with(PROGRESSING) || default.type_.ends_with(DEGRADED) {
        ConditionStatus::True
    } else {
        return Err(Error::internal_with_context(
            "status",
            format!("can't aggregate conditions of unsupported type {:?}", default.type_),
        ));
    };

    let matching: Vec<&Condition> = conditions
        .iter()
        .filter(|c| c.observed_generation == default.observed_generation)
        .filter(|c| c.status == decisive)
        .collect();

    let Some(first) = matching.first() else {
        return Ok(default);
    };

    Ok(Condition {
        type_: default.type_,
        status: decisive,
        reason: first.reason.clone(),
        message: matching
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        observed_generation: default.observed_generation,
        last_transition_time: Utc::now(),
    })
}

/// Contributions to the aggregate `suffix`, excluding the aggregate itself
pub fn find_status_conditions_with_suffix(conditions: &[Condition], suffix: &str) -> Vec<Condition> {
    conditions
        .iter()
        .filter(|c| c.type_ != suffix && c.type_.ends_with(suffix))
        .cloned()
        .collect()
}

/// Upsert `condition` by type
///
/// `last_transition_time` only moves when the status changes.
pub fn set_status_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
        None => conditions.push(condition),
    }
}

/// Look up a condition by type
pub fn find_status_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Record the outcome of a sync stage in its degraded condition
pub fn set_status_condition_from_error(
    conditions: &mut Vec<Condition>,
    err: Option<&Error>,
    degraded_type: &str,
    generation: i64,
) {
    let condition = match err {
        Some(err) => Condition::new(degraded_type, ConditionStatus::True, ERROR_REASON, err.to_string()),
        None => Condition::new(degraded_type, ConditionStatus::False, AS_EXPECTED_REASON, ""),
    };
    set_status_condition(conditions, condition.with_generation(generation));
}

/// Progressing contribution for an object that was just created or updated
pub fn add_generic_progressing_status_condition<K>(
    conditions: &mut Vec<Condition>,
    progressing_type: &str,
    obj: &K,
    verb: &str,
    generation: i64,
) where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&()).to_lowercase();
    let object = match obj.namespace() {
        Some(ns) => format!("{ns}/{}", obj.name_any()),
        None => obj.name_any(),
    };
    conditions.push(
        Condition::new(
            progressing_type,
            ConditionStatus::True,
            PROGRESSING_REASON,
            format!("Waiting for {kind} {object:?} to be {verb}."),
        )
        .with_generation(generation),
    );
}

/// Run one sync stage and record its outcome
///
/// `stage` yields the stage's progressing contributions. On error the
/// degraded condition turns True and the error is returned; on success the
/// degraded condition turns False and the contributions are folded into the
/// stage's progressing condition.
pub async fn run_sync<F>(
    conditions: &mut Vec<Condition>,
    progressing_type: &str,
    degraded_type: &str,
    generation: i64,
    stage: F,
) -> keel_common::Result<()>
where
    F: Future<Output = keel_common::Result<Vec<Condition>>>,
{
    let progressing = match stage.await {
        Ok(progressing) => progressing,
        Err(err) => {
            debug!(condition = %degraded_type, error = %err, "Sync stage failed");
            set_status_condition_from_error(conditions, Some(&err), degraded_type, generation);
            return Err(err);
        }
    };
    set_status_condition_from_error(conditions, None, degraded_type, generation);

    let aggregated = aggregate_status_conditions(
        &progressing,
        Condition::new(progressing_type, ConditionStatus::False, AS_EXPECTED_REASON, "")
            .with_generation(generation),
    )?;
    set_status_condition(conditions, aggregated);
    Ok(())
}

/// Recompute `Available`, `Progressing` and `Degraded` from all contributions
///
/// Defaults when nothing is decisive: Available=True, Progressing=False,
/// Degraded=False.
pub fn set_aggregated_workload_conditions(
    conditions: &mut Vec<Condition>,
    generation: i64,
) -> keel_common::Result<()> {
    set_aggregated_workload_conditions_by_suffixes(
        conditions,
        AVAILABLE,
        PROGRESSING,
        DEGRADED,
        generation,
    )
}

/// [`set_aggregated_workload_conditions`] for a prefixed family of aggregates
///
/// Each aggregate type doubles as the suffix its contributions are found by,
/// so `RemoteAvailable` folds `DatacenterRemoteAvailable` and friends. The
/// types must still end in `Available`, `Progressing` and `Degraded`.
pub fn set_aggregated_workload_conditions_by_suffixes(
    conditions: &mut Vec<Condition>,
    available_type: &str,
    progressing_type: &str,
    degraded_type: &str,
    generation: i64,
) -> keel_common::Result<()> {
    for (type_, default_status) in [
        (available_type, ConditionStatus::True),
        (progressing_type, ConditionStatus::False),
        (degraded_type, ConditionStatus::False),
    ] {
        let aggregated = aggregate_status_conditions(
            &find_status_conditions_with_suffix(conditions, type_),
            Condition::new(type_, default_status, AS_EXPECTED_REASON, "").with_generation(generation),
        )?;
        set_status_condition(conditions, aggregated);
    }
    Ok(())
}
