//! Desired child objects of a MaintenanceTask

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvFromSource, PodSpec, PodTemplateSpec, SecretEnvSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use keel_common::crd::MaintenanceTask;
use keel_common::{MAINTENANCE_TASK_NAME_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use keel_controller::{ControllerIdentity, Selector};

/// Name of the container running the task
pub const TASK_CONTAINER_NAME: &str = "task";

/// Labels stamped on every child of `task`
pub fn task_labels(task: &MaintenanceTask) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MAINTENANCE_TASK_NAME_LABEL.to_string(), task.name_any()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// Selector matching the children of `task`
pub fn task_selector(task: &MaintenanceTask) -> Selector {
    Selector::from_iter([(MAINTENANCE_TASK_NAME_LABEL.to_string(), task.name_any())])
}

/// The Job executing `task`
///
/// Shares the task's name and namespace. Fails if the task has no UID yet.
pub fn make_job(task: &MaintenanceTask) -> keel_common::Result<Job> {
    let owner = ControllerIdentity::of::<MaintenanceTask>().controller_ref(task)?;
    let labels = task_labels(task);

    let env_from = task.spec.credentials_secret_ref.as_ref().map(|secret| {
        vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: secret.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        }]
    });

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(task.name_any()),
            namespace: task.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: task.spec.backoff_limit,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: TASK_CONTAINER_NAME.to_string(),
                        image: Some(task.spec.image.clone()),
                        command: non_empty(&task.spec.command),
                        args: non_empty(&task.spec.args),
                        env_from,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// Whether the Job reports a True condition of `type_`
fn has_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
}

/// Whether the Job finished successfully
pub fn is_job_complete(job: &Job) -> bool {
    has_condition(job, "Complete")
}

/// Whether the Job gave up
pub fn is_job_failed(job: &Job) -> bool {
    has_condition(job, "Failed")
}
