use crate::kernel::{FiberOutcome, Topology};
use crate::model::DomainSnapshot;
use crate::processor::Processor;
use crate::util::colors::{FG1, FG2};
use crate::util::patch::patch_status;
use crate::util::{Error, ErrorKind, PROBE_INTERVAL};
#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;
use domain_types::{Domain, DomainPhase, DomainStatus, condition_types};
use futures::stream::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    Api, Client, ResourceExt,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RECONCILE_TIMEOUT: Duration = Duration::from_secs(300);
const RETRY_AFTER: Duration = Duration::from_secs(5);

/// Entrypoint for the `Domain` controller. No leader election: the gate's own
/// single-flight guarantee is what keeps two reconciles of the same domain
/// from racing, so one controller replica is all this needs.
pub async fn run(client: Client, namespace: &str, processor: Arc<Processor>, shutdown: CancellationToken) {
    println!("{}", "Starting Domain controller".green());
    let context = Arc::new(ContextData::new(client.clone(), processor));
    let api: Api<Domain> = Api::namespaced(client, namespace);
    Controller::new(api, Default::default())
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
}

struct ContextData {
    client: Client,
    processor: Arc<Processor>,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    fn new(client: Client, processor: Arc<Processor>) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData { client, processor, metrics: ControllerMetrics::new("domain_operator") }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client, processor }
        }
    }
}

async fn reconcile(instance: Arc<Domain>, ctx: Arc<ContextData>) -> Result<Action, Error> {
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::Validation("Domain resource is missing metadata.namespace".to_string()))?;

    #[cfg(feature = "metrics")]
    ctx.metrics.reconcile_counter.with_label_values(&[&name, &namespace]).inc();
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let snapshot = match DomainSnapshot::from_domain(&instance) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            mark_failed(&ctx.client, &instance, &e.to_string()).await?;
            return Ok(action_for(&e));
        }
    };
    let generation = snapshot.generation;

    println!(
        "{}{}{}{}",
        namespace.color(FG2),
        "/".color(FG1),
        name.color(FG2),
        " reconciling".color(FG1),
    );

    let (_fiber, completion) = ctx.processor.submit(snapshot, Topology::default());
    let outcome = tokio::time::timeout(RECONCILE_TIMEOUT, completion).await;

    #[cfg(feature = "metrics")]
    ctx.metrics
        .write_histogram
        .with_label_values(&[&name, &namespace, "reconcile"])
        .observe(start.elapsed().as_secs_f64());

    match outcome {
        Ok(Ok(FiberOutcome::Completed)) => {
            mark_available(&ctx.client, &instance, generation).await?;
            Ok(Action::requeue(PROBE_INTERVAL))
        }
        Ok(Ok(FiberOutcome::Cancelled)) => {
            // Pre-empted by a newer submission for the same key; the fiber
            // that replaced it owns reporting the eventual outcome.
            Ok(Action::await_change())
        }
        Ok(Ok(FiberOutcome::Failed(e))) => {
            mark_failed(&ctx.client, &instance, &e.to_string()).await?;
            Ok(action_for(&e))
        }
        Ok(Err(_recv_dropped)) => {
            mark_failed(&ctx.client, &instance, "fiber terminated without reporting an outcome").await?;
            Ok(Action::requeue(RETRY_AFTER))
        }
        Err(_elapsed) => {
            mark_failed(&ctx.client, &instance, "reconciliation timed out").await?;
            Ok(Action::requeue(RETRY_AFTER))
        }
    }
}

/// Validation and internal errors describe a snapshot that will fail the same
/// way again; requeuing on a timer just busy-loops until a user edits the
/// Domain, so those wait for the next generation instead. Transient and
/// watch-timeout errors are expected to clear on their own and get a retry.
fn action_for(e: &Error) -> Action {
    match e.kind() {
        ErrorKind::Validation | ErrorKind::Internal => Action::await_change(),
        ErrorKind::Transient | ErrorKind::WatchTimeout | ErrorKind::NotFound | ErrorKind::Cancelled => {
            Action::requeue(RETRY_AFTER)
        }
    }
}

async fn mark_available(client: &Client, instance: &Domain, generation: i64) -> Result<(), Error> {
    patch_status::<DomainStatus, Domain>(client.clone(), instance, |status| {
        status.phase = DomainPhase::Available;
        status.observed_generation = generation;
        status.message = None;
        upsert_condition(&mut status.conditions, condition_types::COMPLETED, "True", "ReconcileSucceeded");
        upsert_condition(&mut status.conditions, condition_types::AVAILABLE, "True", "ReconcileSucceeded");
        upsert_condition(&mut status.conditions, condition_types::FAILED, "False", "ReconcileSucceeded");
    })
    .await?;
    Ok(())
}

async fn mark_failed(client: &Client, instance: &Domain, message: &str) -> Result<(), Error> {
    patch_status::<DomainStatus, Domain>(client.clone(), instance, |status| {
        status.phase = DomainPhase::Failed;
        status.message = Some(message.to_string());
        upsert_condition(&mut status.conditions, condition_types::FAILED, "True", "ReconcileFailed");
        upsert_condition(&mut status.conditions, condition_types::AVAILABLE, "False", "ReconcileFailed");
        upsert_condition(&mut status.conditions, condition_types::COMPLETED, "False", "ReconcileFailed");
    })
    .await?;
    Ok(())
}

fn upsert_condition(conditions: &mut Vec<Condition>, type_: &str, status: &str, reason: &str) {
    let now = k8s_openapi::apimachinery::pkg::apis::meta::v1::Time::from(k8s_openapi::jiff::Timestamp::now());
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: String::new(),
            observed_generation: None,
            last_transition_time: now,
        });
    }
}

fn on_error(instance: Arc<Domain>, error: &Error, _ctx: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("reconciliation error for {}: {error}", instance.name_any()).red()
    );
    Action::requeue(RETRY_AFTER)
}
