//! Informer wiring and controller startup against a live cluster

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::{reflector, watcher};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_common::crd::MaintenanceTask;
use keel_common::events::{EventPublisher, KubeEventPublisher};
use keel_common::{ControllerConfig, Error, OPERATOR_NAME};
use keel_controller::handlers::HandlerOperation;
use keel_controller::source::{run_notifications, watch, NotificationSource};
use keel_controller::{
    Applier, ClaimControl, Controller, ControllerIdentity, DigestConfig, Handlers,
    KubeClaimControl, KubeControl, Pruner,
};

use crate::controller::{TaskContext, TaskReconciler};

/// Run the MaintenanceTask controller until `shutdown` fires
///
/// Starts informers for tasks, Jobs and Secrets, waits for their caches to
/// fill, then runs `config.workers` sync workers.
pub async fn run(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> keel_common::Result<()> {
    let (task_store, task_writer) = reflector::store::<MaintenanceTask>();
    let (job_store, job_writer) = reflector::store::<Job>();
    let (secret_store, secret_writer) = reflector::store::<Secret>();

    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), OPERATOR_NAME));
    let job_control = Arc::new(KubeControl::new(client.clone(), job_store.clone()));
    let claim_client = client.clone();

    let ctx = TaskContext {
        tasks: Arc::new(task_store.clone()),
        jobs: Arc::new(job_store.clone()),
        secrets: Arc::new(secret_store.clone()),
        claim_control: Arc::new(move |ns: &str| {
            Box::new(KubeClaimControl::<MaintenanceTask, Job>::namespaced(
                claim_client.clone(),
                ns,
            )) as Box<dyn ClaimControl<MaintenanceTask, Job>>
        }),
        job_applier: Applier::<Job>::new(job_control.clone(), events.clone(), DigestConfig::default()),
        job_pruner: Pruner::<Job>::new(job_control, events),
        status: Arc::new(KubeControl::new(client.clone(), task_store.clone())),
    };

    let controller = Controller::new(Arc::new(TaskReconciler::new(ctx)), config.clone());
    let handlers = Handlers::<MaintenanceTask>::new(
        controller.queue().clone(),
        ControllerIdentity::of::<MaintenanceTask>(),
        Arc::new(task_store.clone()),
    );

    let mut informers = JoinSet::new();

    let h = handlers.clone();
    informers.spawn(run_notifications(
        NotificationSource::new(task_writer),
        watch(Api::<MaintenanceTask>::all(client.clone()), watcher::Config::default()),
        move |n| h.handle(n, &|task: &MaintenanceTask, op: HandlerOperation| h.enqueue(task, op)),
    ));

    let h = handlers.clone();
    informers.spawn(run_notifications(
        NotificationSource::new(job_writer),
        watch(Api::<Job>::all(client.clone()), watcher::Config::default()),
        move |n| h.handle(n, &|job: &Job, op: HandlerOperation| h.enqueue_owner(job, op)),
    ));

    let h = handlers;
    informers.spawn(run_notifications(
        NotificationSource::new(secret_writer),
        watch(Api::<Secret>::all(client), watcher::Config::default()),
        move |n| {
            h.handle(n, &|secret: &Secret, op: HandlerOperation| {
                let name = secret.name_any();
                h.enqueue_all_with_filter(secret, op, &|task: &MaintenanceTask| {
                    task.spec.credentials_secret_ref.as_deref() == Some(name.as_str())
                })
            })
        },
    ));

    info!("Waiting for informer caches to sync");
    tokio::select! {
        _ = shutdown.cancelled() => {
            informers.abort_all();
            return Ok(());
        }
        ready = futures::future::try_join3(
            task_store.wait_until_ready(),
            job_store.wait_until_ready(),
            secret_store.wait_until_ready(),
        ) => {
            ready.map_err(|e| Error::internal_with_context("informers", e.to_string()))?;
        }
    }

    info!(workers = config.workers, "Caches synced, starting MaintenanceTask controller");
    controller.run(config.workers, shutdown).await;
    informers.abort_all();
    Ok(())
}
