//! MaintenanceTask status computation and persistence

use tracing::debug;

use keel_common::crd::{MaintenanceTask, MaintenanceTaskStatus};
use keel_controller::{ObjectKey, StatusControl};

/// Progressing contribution of the Job sub-controller
pub const JOB_CONTROLLER_PROGRESSING: &str = "JobControllerProgressing";

/// Degraded contribution of the Job sub-controller
pub const JOB_CONTROLLER_DEGRADED: &str = "JobControllerDegraded";

/// Starting point for this sync's status: the current status stamped with
/// the generation being acted on
pub fn calculate_status(task: &MaintenanceTask) -> MaintenanceTaskStatus {
    let mut status = task.status.clone().unwrap_or_default();
    status.observed_generation = task.metadata.generation;
    status
}

/// Persist `status` unless it equals what the task already reports
///
/// The write is pinned to the task's resourceVersion, so a status computed
/// from a stale cache fails with a Conflict instead of overwriting newer data.
pub async fn update_status(
    control: &dyn StatusControl,
    task: &MaintenanceTask,
    status: MaintenanceTaskStatus,
) -> keel_common::Result<()> {
    if task.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let key = ObjectKey::from_object(task);
    debug!(task = %key, "Updating status");
    control
        .update_status(
            &key,
            task.metadata.resource_version.as_deref(),
            &serde_json::to_value(&status)?,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keel_common::crd::MaintenanceTaskSpec;
    use keel_common::{Condition, ConditionStatus};
    use parking_lot::Mutex;
    use serde_json::Value;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Option<String>, Value)>>);

    #[async_trait]
    impl StatusControl for Recorder {
        async fn update_status(
            &self,
            _key: &ObjectKey,
            resource_version: Option<&str>,
            status: &Value,
        ) -> keel_common::Result<()> {
            self.0
                .lock()
                .push((resource_version.map(str::to_string), status.clone()));
            Ok(())
        }
    }

    fn task() -> MaintenanceTask {
        let mut task = MaintenanceTask::new("t", MaintenanceTaskSpec::default());
        task.metadata.namespace = Some("ns".to_string());
        task.metadata.generation = Some(4);
        task.metadata.resource_version = Some("10".to_string());
        task
    }

    #[test]
    fn calculated_status_observes_current_generation() {
        let mut t = task();
        t.status = Some(MaintenanceTaskStatus {
            observed_generation: Some(3),
            conditions: vec![Condition::new("Available", ConditionStatus::True, "AsExpected", "")],
        });
        let status = calculate_status(&t);
        assert_eq!(status.observed_generation, Some(4));
        assert_eq!(status.conditions.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let recorder = Recorder::default();
        let mut t = task();
        let status = calculate_status(&t);

        update_status(&recorder, &t, status.clone()).await.unwrap();
        assert_eq!(recorder.0.lock().len(), 1);
        assert_eq!(recorder.0.lock()[0].1["observedGeneration"], 4);

        t.status = Some(status.clone());
        update_status(&recorder, &t, status).await.unwrap();
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn status_write_is_pinned_to_cached_resource_version() {
        let recorder = Recorder::default();
        let t = task();
        update_status(&recorder, &t, calculate_status(&t)).await.unwrap();
        assert_eq!(recorder.0.lock()[0].0.as_deref(), Some("10"));
    }
}
