use crate::kernel::{NextAction, Packet, Step, StepRef};
use crate::model::ServerIdentity;
use crate::pod::{PodClient, PodWatcher, pod_hash};
use crate::util::{Error, ErrorKind};
use async_trait::async_trait;
use domain_types::{ServerPodSpec, ServerResources};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, ResourceRequirements};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(120);

/// Builds the desired `v1/Pod` for a server identity. The concrete
/// container layout a real WebLogic server needs — volumes, probes, ports —
/// is out of scope here; this only needs to be stable so the hash/overlay
/// decisions in [`PodStep`] have a real object to diff against.
pub trait PodModelBuilder: Send + Sync {
    fn build(&self, identity: &ServerIdentity, spec: &ServerPodSpec, hash: &str) -> Pod;
}

pub struct DefaultPodModelBuilder;

impl PodModelBuilder for DefaultPodModelBuilder {
    fn build(&self, identity: &ServerIdentity, spec: &ServerPodSpec, hash: &str) -> Pod {
        let mut labels = spec.labels.clone();
        labels.insert(domain_common::labels::DOMAIN_UID.to_string(), identity.domain_uid.clone());
        labels.insert(domain_common::labels::SERVER_NAME.to_string(), identity.server_name.clone());
        if let Some(cluster_name) = &identity.cluster_name {
            labels.insert(domain_common::labels::CLUSTER_NAME.to_string(), cluster_name.clone());
        }

        let mut annotations = spec.annotations.clone();
        annotations.insert(domain_common::annotations::POD_HASH.to_string(), hash.to_string());
        annotations.insert(domain_common::annotations::CREATED_BY.to_string(), domain_common::MANAGER_NAME.to_string());

        Pod {
            metadata: ObjectMeta {
                name: Some(identity.pod_name()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "weblogic-server".to_string(),
                    image: Some(spec.image.clone()),
                    env: Some(
                        spec.env
                            .iter()
                            .map(|(name, value)| EnvVar {
                                name: name.clone(),
                                value: Some(value.clone()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    resources: Some(to_resource_requirements(&spec.resources)),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn to_resource_requirements(resources: &ServerResources) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    for (name, (request, limit)) in resources.to_quantities() {
        if let Some(q) = request {
            requests.insert(name.clone(), q);
        }
        if let Some(q) = limit {
            limits.insert(name, q);
        }
    }
    ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    }
}

/// The "enqueue a re-introspection sub-workflow" side of the admin-server
/// rebuild trigger. Producing a fresh topology scan is out of scope here;
/// this only needs to signal that one was requested.
#[async_trait]
pub trait ReintrospectionTrigger: Send + Sync {
    async fn trigger(&self, identity: &ServerIdentity) -> Result<(), Error>;
}

pub struct LoggingReintrospectionTrigger;

#[async_trait]
impl ReintrospectionTrigger for LoggingReintrospectionTrigger {
    async fn trigger(&self, identity: &ServerIdentity) -> Result<(), Error> {
        println!(
            "{}",
            format!(
                "introspection required before rebuilding {} — deferring pod work",
                identity.pod_name()
            )
        );
        Ok(())
    }
}

/// Collaborators a [`PodStep`] needs, bundled so the chain can pass one
/// handle instead of four.
pub struct PodStepContext {
    pub client: Arc<dyn PodClient>,
    pub watcher: Arc<PodWatcher>,
    pub builder: Arc<dyn PodModelBuilder>,
    pub reintrospect: Arc<dyn ReintrospectionTrigger>,
    pub namespace: String,
    pub ready_timeout: Duration,
    pub delete_timeout: Duration,
}

impl PodStepContext {
    pub fn new(client: Arc<dyn PodClient>, watcher: Arc<PodWatcher>, namespace: impl Into<String>) -> Arc<Self> {
        Arc::new(PodStepContext {
            client,
            watcher,
            builder: Arc::new(DefaultPodModelBuilder),
            reintrospect: Arc::new(LoggingReintrospectionTrigger),
            namespace: namespace.into(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
        })
    }
}

/// POSTs the desired pod and awaits its arrival as Ready. Shared by the CREATE
/// branch of [`PodStep`] and by [`RollCycleStep`] once a deferred roll's
/// predecessor has been deleted and the replacement needs to be created and
/// awaited ready.
async fn create_and_await_ready(
    ctx: &PodStepContext,
    identity: &ServerIdentity,
    desired_spec: &ServerPodSpec,
) -> Result<(), Error> {
    let hash = pod_hash(desired_spec);
    let pod = ctx.builder.build(identity, desired_spec, &hash);
    ctx.client.create(&ctx.namespace, pod).await?;
    ctx.watcher
        .wait_for_ready(ctx.client.as_ref(), &identity.pod_name(), ctx.ready_timeout)
        .await
}

/// The per-server pod-lifecycle decision procedure: READ, then
/// CREATE / PATCH / ROLL depending on what's live.
#[derive(Clone)]
pub struct PodStep {
    pub ctx: Arc<PodStepContext>,
    pub identity: ServerIdentity,
    pub desired_spec: ServerPodSpec,
    pub next: StepRef,
}

#[async_trait]
impl Step for PodStep {
    async fn run(&self, packet: &mut Packet) -> NextAction {
        let name = self.identity.pod_name();
        let live = match self.ctx.client.get(&self.ctx.namespace, &name).await {
            Ok(live) => live,
            Err(e) if e.kind() == ErrorKind::Transient => {
                return NextAction::Delay { step: Arc::new(self.clone()), after: RETRY_DELAY };
            }
            Err(e) => return NextAction::Throw(e),
        };

        let Some(live) = live else {
            return NextAction::suspend_on(self.create_branch());
        };

        if live.metadata.deletion_timestamp.is_some() {
            return NextAction::suspend_on(self.await_deletion_then_reenter());
        }

        let failed = live.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed");
        let desired_hash = pod_hash(&self.desired_spec);
        let live_hash = live
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(domain_common::annotations::POD_HASH))
            .cloned();
        let needs_replace = failed || live_hash.as_deref() != Some(desired_hash.as_str());

        if needs_replace {
            if packet.snapshot.introspection_required {
                return NextAction::suspend_on(self.reintrospect_and_abort());
            }
            return if self.identity.cluster_name.is_none() {
                NextAction::suspend_on(self.replace_immediately())
            } else {
                NextAction::suspend_on(self.defer_to_coordinator(packet, live))
            };
        }

        NextAction::suspend_on(self.patch_overlay(live))
    }

    fn name(&self) -> &str {
        "pod-step"
    }
}

impl PodStep {
    fn create_branch(&self) -> futures::future::BoxFuture<'static, NextAction> {
        let ctx = self.ctx.clone();
        let identity = self.identity.clone();
        let desired_spec = self.desired_spec.clone();
        let next = self.next.clone();
        Box::pin(async move {
            match create_and_await_ready(&ctx, &identity, &desired_spec).await {
                Ok(()) => NextAction::Advance(next),
                Err(e) => NextAction::Throw(e),
            }
        })
    }

    fn await_deletion_then_reenter(&self) -> futures::future::BoxFuture<'static, NextAction> {
        let ctx = self.ctx.clone();
        let identity = self.identity.clone();
        let reenter: StepRef = Arc::new(self.clone());
        Box::pin(async move {
            let name = identity.pod_name();
            match ctx.watcher.wait_for_deleted(ctx.client.as_ref(), &name, ctx.delete_timeout).await {
                Ok(()) => NextAction::Advance(reenter),
                Err(e) => NextAction::Throw(e),
            }
        })
    }

    fn reintrospect_and_abort(&self) -> futures::future::BoxFuture<'static, NextAction> {
        let ctx = self.ctx.clone();
        let identity = self.identity.clone();
        Box::pin(async move {
            match ctx.reintrospect.trigger(&identity).await {
                Ok(()) => NextAction::Terminate,
                Err(e) => NextAction::Throw(e),
            }
        })
    }

    fn replace_immediately(&self) -> futures::future::BoxFuture<'static, NextAction> {
        let ctx = self.ctx.clone();
        let identity = self.identity.clone();
        let desired_spec = self.desired_spec.clone();
        let next = self.next.clone();
        Box::pin(async move {
            let name = identity.pod_name();
            let grace = desired_spec.shutdown_timeout_seconds as i64 + 10;
            if let Err(e) = ctx.client.delete(&ctx.namespace, &name, grace).await {
                return NextAction::Throw(e);
            }
            if let Err(e) = ctx.watcher.wait_for_deleted(ctx.client.as_ref(), &name, ctx.delete_timeout).await {
                return NextAction::Throw(e);
            }
            match create_and_await_ready(&ctx, &identity, &desired_spec).await {
                Ok(()) => NextAction::Advance(next),
                Err(e) => NextAction::Throw(e),
            }
        })
    }

    /// PATCHes the `to-be-rolled=true` label. The label is advisory bookkeeping
    /// for the coordinator, not a precondition for the roll, so a failed PATCH
    /// is logged and swallowed rather than aborting the roll. Then surrenders
    /// this server to the Roll Coordinator.
    fn defer_to_coordinator(&self, packet: &Packet, live: Pod) -> futures::future::BoxFuture<'static, NextAction> {
        let ctx = self.ctx.clone();
        let identity = self.identity.clone();
        let desired_spec = self.desired_spec.clone();
        let next = self.next.clone();
        let packet_for_defer = packet.clone();
        let packet_snapshot = match &identity.cluster_name {
            Some(cluster) => packet.for_cluster(cluster.clone()).copy(),
            None => packet.copy(),
        };
        Box::pin(async move {
            let name = identity.pod_name();
            let mut labels = live.metadata.labels.clone().unwrap_or_default();
            let before = serde_json::json!({ "metadata": { "labels": labels.clone() } });
            labels.insert(domain_common::labels::TO_BE_ROLLED.to_string(), "true".to_string());
            let after = serde_json::json!({ "metadata": { "labels": labels } });
            let label_patch = json_patch::diff(&before, &after);
            if !label_patch.0.is_empty() {
                if let Err(e) = ctx.client.patch(&ctx.namespace, &name, label_patch).await {
                    eprintln!("failed to label {name} for rolling, proceeding with the roll anyway: {e}");
                }
            }

            let cycle: StepRef = Arc::new(RollCycleStep {
                ctx: ctx.clone(),
                identity: identity.clone(),
                desired_spec,
            });
            packet_for_defer.defer_roll(identity.server_name.clone(), crate::kernel::DeferredRoll {
                cycle,
                packet: packet_snapshot,
            });
            NextAction::Advance(next)
        })
    }

    fn patch_overlay(&self, live: Pod) -> futures::future::BoxFuture<'static, NextAction> {
        let ctx = self.ctx.clone();
        let identity = self.identity.clone();
        let desired_spec = self.desired_spec.clone();
        let next = self.next.clone();
        Box::pin(async move {
            let hash = pod_hash(&desired_spec);
            let desired = ctx.builder.build(&identity, &desired_spec, &hash);
            let before = serde_json::json!({
                "metadata": {
                    "labels": live.metadata.labels.clone().unwrap_or_default(),
                    "annotations": live.metadata.annotations.clone().unwrap_or_default(),
                }
            });
            let after = serde_json::json!({
                "metadata": {
                    "labels": desired.metadata.labels.clone().unwrap_or_default(),
                    "annotations": desired.metadata.annotations.clone().unwrap_or_default(),
                }
            });
            let patch = json_patch::diff(&before, &after);
            if patch.0.is_empty() {
                return NextAction::Advance(next);
            }
            match ctx.client.patch(&ctx.namespace, &identity.pod_name(), patch).await {
                Ok(_) => NextAction::Advance(next),
                Err(e) if e.is_not_found() => NextAction::Advance(Arc::new(PodStep { ctx, identity, desired_spec, next })),
                Err(e) => NextAction::Throw(e),
            }
        })
    }
}

/// The deferred half of a roll: delete the outgoing pod, await its
/// removal, then rebuild and await readiness. Constructed once per server by
/// [`PodStep::defer_to_coordinator`] and driven later by the Roll Coordinator.
pub struct RollCycleStep {
    pub ctx: Arc<PodStepContext>,
    pub identity: ServerIdentity,
    pub desired_spec: ServerPodSpec,
}

#[async_trait]
impl Step for RollCycleStep {
    async fn run(&self, _packet: &mut Packet) -> NextAction {
        let ctx = self.ctx.clone();
        let identity = self.identity.clone();
        let desired_spec = self.desired_spec.clone();
        NextAction::suspend_on(async move {
            let name = identity.pod_name();
            let grace = desired_spec.shutdown_timeout_seconds as i64 + 10;
            if let Err(e) = ctx.client.delete(&ctx.namespace, &name, grace).await {
                return NextAction::Throw(e);
            }
            if let Err(e) = ctx.watcher.wait_for_deleted(ctx.client.as_ref(), &name, ctx.delete_timeout).await {
                return NextAction::Throw(e);
            }
            match create_and_await_ready(&ctx, &identity, &desired_spec).await {
                Ok(()) => NextAction::Terminate,
                Err(e) => NextAction::Throw(e),
            }
        })
    }

    fn name(&self) -> &str {
        "roll-cycle"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DomainSnapshot;
    use crate::pod::client::InMemoryPodClient;

    fn snapshot(introspection_required: bool) -> DomainSnapshot {
        DomainSnapshot {
            domain_uid: "d1".to_string(),
            namespace: "ns".to_string(),
            generation: 1,
            admin_server: crate::model::AdminServerSnapshot {
                server_name: "admin".to_string(),
                pod: Default::default(),
            },
            clusters: vec![],
            introspection_required,
        }
    }

    struct TerminalNext;

    #[async_trait]
    impl Step for TerminalNext {
        async fn run(&self, _packet: &mut Packet) -> NextAction {
            NextAction::Terminate
        }
        fn name(&self) -> &str {
            "terminal"
        }
    }

    fn ready_pod(name: &str) -> Pod {
        use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
        Pod {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_branch_builds_and_waits_ready() {
        let client: Arc<dyn PodClient> = Arc::new(InMemoryPodClient::new());
        let watcher = PodWatcher::new("ns");
        let ctx = PodStepContext::new(client, watcher.clone(), "ns");
        let step = PodStep {
            ctx,
            identity: ServerIdentity::admin("d1", "admin"),
            desired_spec: ServerPodSpec { image: "weblogic:14.1.1".to_string(), ..Default::default() },
            next: Arc::new(TerminalNext),
        };
        let handle = tokio::spawn(async move { step.create_branch().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.on_apply(&ready_pod("d1-admin"));
        let resolved = handle.await.unwrap();
        assert!(matches!(resolved, NextAction::Advance(_)));
    }

    #[tokio::test]
    async fn introspection_required_aborts_instead_of_rolling() {
        let client = InMemoryPodClient::new();
        client.seed("ns", "d1-admin", {
            use k8s_openapi::api::core::v1::PodStatus;
            Pod {
                metadata: ObjectMeta {
                    name: Some("d1-admin".to_string()),
                    annotations: Some(BTreeMap::from([(
                        domain_common::annotations::POD_HASH.to_string(),
                        "stale".to_string(),
                    )])),
                    ..Default::default()
                },
                status: Some(PodStatus { phase: Some("Running".to_string()), ..Default::default() }),
                ..Default::default()
            }
        });
        let client: Arc<dyn PodClient> = Arc::new(client);
        let watcher = PodWatcher::new("ns");
        let ctx = PodStepContext::new(client, watcher, "ns");
        let step = PodStep {
            ctx,
            identity: ServerIdentity::admin("d1", "admin"),
            desired_spec: ServerPodSpec { image: "weblogic:14.1.1".to_string(), ..Default::default() },
            next: Arc::new(TerminalNext),
        };
        let mut packet = Packet::new(snapshot(true), Default::default());
        let action = step.run(&mut packet).await;
        let NextAction::Suspend(fut) = action else { panic!("expected suspend") };
        let resolved = fut.await;
        assert!(matches!(resolved, NextAction::Terminate));
    }

    #[tokio::test]
    async fn hash_mismatch_on_clustered_server_defers_to_coordinator() {
        let client = InMemoryPodClient::new();
        client.seed("ns", "c1-1", {
            use k8s_openapi::api::core::v1::PodStatus;
            Pod {
                metadata: ObjectMeta {
                    name: Some("c1-1".to_string()),
                    annotations: Some(BTreeMap::from([(
                        domain_common::annotations::POD_HASH.to_string(),
                        "stale".to_string(),
                    )])),
                    ..Default::default()
                },
                status: Some(PodStatus { phase: Some("Running".to_string()), ..Default::default() }),
                ..Default::default()
            }
        });
        let client: Arc<dyn PodClient> = Arc::new(client);
        let watcher = PodWatcher::new("ns");
        let ctx = PodStepContext::new(client, watcher, "ns");
        let step = PodStep {
            ctx,
            identity: ServerIdentity::clustered("d1", "c1", "c1-1"),
            desired_spec: ServerPodSpec { image: "weblogic:14.1.1".to_string(), ..Default::default() },
            next: Arc::new(TerminalNext),
        };
        let mut packet = Packet::new(snapshot(false), Default::default());
        let action = step.run(&mut packet).await;
        let NextAction::Suspend(fut) = action else { panic!("expected suspend") };
        let resolved = fut.await;
        assert!(matches!(resolved, NextAction::Advance(_)));
        assert_eq!(packet.servers_to_roll_len(), 1);
    }
}
