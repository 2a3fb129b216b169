//! MaintenanceTask controller implementation
//!
//! Each sync claims the Jobs labeled for the task, prunes the ones that are no
//! longer wanted, applies the desired Job and folds the outcome into the
//! task's Available/Progressing/Degraded conditions:
//! - Credentials Secret referenced but missing: wait (Progressing)
//! - Job running: `AwaitingJobCompletion` (Progressing)
//! - Job failed: permanent error (Degraded), not retried

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::debug;

use keel_common::crd::MaintenanceTask;
use keel_common::{Condition, ConditionStatus, Error};
use keel_controller::object::is_being_deleted;
use keel_controller::status::{
    add_generic_progressing_status_condition, run_sync, set_aggregated_workload_conditions,
};
use keel_controller::{
    get_objects, Applier, ApplyOptions, ClaimControl, ControllerIdentity, ControllerRefManager,
    ObjectKey, ObjectLister, Pruner, Reconciler, StatusControl, SyncContext,
};

use crate::resource::{is_job_complete, is_job_failed, make_job, task_selector};
use crate::status::{
    calculate_status, update_status, JOB_CONTROLLER_DEGRADED, JOB_CONTROLLER_PROGRESSING,
};

/// Controller name, used for the work queue and in logs
pub const CONTROLLER_NAME: &str = "MaintenanceTaskController";

/// Progressing reason while the credentials Secret does not exist
pub const WAITING_FOR_CREDENTIALS_REASON: &str = "WaitingForCredentials";

/// Progressing reason while the Job runs
pub const AWAITING_JOB_COMPLETION_REASON: &str = "AwaitingJobCompletion";

/// Builds the claim control for one namespace
pub type ClaimControlFactory =
    Arc<dyn Fn(&str) -> Box<dyn ClaimControl<MaintenanceTask, Job>> + Send + Sync>;

/// Shared context for the MaintenanceTask controller
pub struct TaskContext {
    /// Cached MaintenanceTasks
    pub tasks: Arc<dyn ObjectLister<MaintenanceTask>>,
    /// Cached Jobs
    pub jobs: Arc<dyn ObjectLister<Job>>,
    /// Cached Secrets
    pub secrets: Arc<dyn ObjectLister<Secret>>,
    /// Adoption and release of Jobs
    pub claim_control: ClaimControlFactory,
    /// Apply engine for Jobs
    pub job_applier: Applier<Job>,
    /// Prune engine for Jobs
    pub job_pruner: Pruner<Job>,
    /// Status writes for MaintenanceTasks
    pub status: Arc<dyn StatusControl>,
}

/// Reconciles MaintenanceTasks into Jobs
pub struct TaskReconciler {
    ctx: TaskContext,
}

impl TaskReconciler {
    /// Create a reconciler over `ctx`
    pub fn new(ctx: TaskContext) -> Self {
        Self { ctx }
    }

    async fn sync_task(&self, sync: &SyncContext, key: &ObjectKey) -> keel_common::Result<()> {
        let Some(task) = self.ctx.tasks.get(key) else {
            debug!(task = %key, "MaintenanceTask has been deleted");
            return Ok(());
        };
        let generation = task.metadata.generation.unwrap_or_default();
        let namespace = task
            .namespace()
            .ok_or_else(|| Error::validation(format!("MaintenanceTask {key} has no namespace")))?;

        let claim_control = (self.ctx.claim_control)(&namespace);
        let mut manager = ControllerRefManager::<MaintenanceTask, Job>::new(
            &task,
            ControllerIdentity::of::<MaintenanceTask>(),
            task_selector(&task),
            claim_control.as_ref(),
        );
        let jobs = sync
            .run("claim jobs", get_objects(&mut manager, self.ctx.jobs.as_ref()))
            .await?;

        let mut status = calculate_status(&task);

        if is_being_deleted(&task) {
            return update_status(self.ctx.status.as_ref(), &task, status).await;
        }

        let mut errors = Vec::new();

        if let Err(err) = run_sync(
            &mut status.conditions,
            JOB_CONTROLLER_PROGRESSING,
            JOB_CONTROLLER_DEGRADED,
            generation,
            self.sync_jobs(sync, &task, &jobs),
        )
        .await
        {
            errors.push(err);
        }

        if let Err(err) = set_aggregated_workload_conditions(&mut status.conditions, generation) {
            errors.push(err);
        }

        if let Err(err) = update_status(self.ctx.status.as_ref(), &task, status).await {
            errors.push(err);
        }

        Error::aggregate(errors)
    }

    /// Drive the task's Job and report progressing contributions
    async fn sync_jobs(
        &self,
        sync: &SyncContext,
        task: &MaintenanceTask,
        jobs: &BTreeMap<String, Job>,
    ) -> keel_common::Result<Vec<Condition>> {
        let generation = task.metadata.generation.unwrap_or_default();
        let mut progressing = Vec::new();

        if let Some(secret) = &task.spec.credentials_secret_ref {
            let secret_key = ObjectKey::namespaced(task.namespace().unwrap_or_default(), secret);
            if self.ctx.secrets.get(&secret_key).is_none() {
                debug!(task = %ObjectKey::from_object(task), secret = %secret_key, "Waiting for credentials");
                progressing.push(
                    Condition::new(
                        JOB_CONTROLLER_PROGRESSING,
                        ConditionStatus::True,
                        WAITING_FOR_CREDENTIALS_REASON,
                        format!("Waiting for Secret \"{secret_key}\" to exist."),
                    )
                    .with_generation(generation),
                );
                return Ok(progressing);
            }
        }

        let required = make_job(task)?;

        sync.run(
            "prune jobs",
            self.ctx
                .job_pruner
                .prune(std::slice::from_ref(&required), jobs.values()),
        )
        .await?;

        let outcome = sync
            .run(
                "apply job",
                self.ctx.job_applier.apply(required, ApplyOptions::default()),
            )
            .await?;
        if outcome.changed {
            add_generic_progressing_status_condition(
                &mut progressing,
                JOB_CONTROLLER_PROGRESSING,
                &outcome.object,
                "applied",
                generation,
            );
        }

        let job = outcome.object;
        let job_key = ObjectKey::from_object(&job);
        if is_job_failed(&job) {
            return Err(Error::non_retriable(
                job_key.to_string(),
                "Job failed, create a new MaintenanceTask to retry",
            ));
        }
        if !is_job_complete(&job) {
            progressing.push(
                Condition::new(
                    JOB_CONTROLLER_PROGRESSING,
                    ConditionStatus::True,
                    AWAITING_JOB_COMPLETION_REASON,
                    format!("Waiting for Job \"{job_key}\" to complete."),
                )
                .with_generation(generation),
            );
        }

        Ok(progressing)
    }
}

#[async_trait]
impl Reconciler for TaskReconciler {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn sync(&self, ctx: &SyncContext, key: &ObjectKey) -> keel_common::Result<()> {
        let started = Instant::now();
        debug!(task = %key, "Started syncing MaintenanceTask");
        let result = self.sync_task(ctx, key).await;
        debug!(task = %key, duration = ?started.elapsed(), "Finished syncing MaintenanceTask");
        result
    }
}
