use crate::kernel::{Engine, Fiber, FiberGate, FiberOutcome, FiberStatus, NextAction, Packet, Step, StepRef, Topology};
use crate::model::{DomainSnapshot, ServerIdentity};
use crate::pod::{PodStep, PodStepContext};
use crate::roll::RollCoordinatorStep;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

struct TerminalStep;

#[async_trait]
impl Step for TerminalStep {
    async fn run(&self, _packet: &mut Packet) -> NextAction {
        NextAction::Terminate
    }
    fn name(&self) -> &str {
        "terminal"
    }
}

/// The upstream-facing surface of the kernel: submit a reconciliation,
/// observe fiber status, or
/// shut everything down. Owns the one `FiberGate` key per `(namespace,
/// domainUID)` and assembles the admin-pod → managed-pod → roll-coordinator
/// chain.
pub struct Processor {
    engine: Arc<Engine>,
    gate: Arc<FiberGate>,
    pod_ctx: Arc<PodStepContext>,
}

impl Processor {
    pub fn new(engine: Arc<Engine>, pod_ctx: Arc<PodStepContext>) -> Self {
        Processor {
            gate: FiberGate::new(engine.clone()),
            engine,
            pod_ctx,
        }
    }

    /// `submit(domainSnapshot) → CompletionFuture`. The gate key is
    /// `(namespace, domainUID)`; a newer submission always pre-empts the
    /// fiber currently occupying it, matching `start`'s always-start policy.
    pub fn submit(&self, snapshot: DomainSnapshot, topology: Topology) -> (Arc<Fiber>, oneshot::Receiver<FiberOutcome>) {
        let key = gate_key(&snapshot);
        let chain = self.build_chain(&snapshot);
        let packet = Packet::new(snapshot, topology);
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let fiber = self.gate.start(key, chain, packet, move |outcome| {
            if let Some(tx) = tx.lock().expect("completion sender poisoned").take() {
                let _ = tx.send(outcome);
            }
        });
        (fiber, rx)
    }

    /// `snapshot() → map[key → fiberStatus]`, for observability.
    pub fn snapshot(&self) -> BTreeMap<String, FiberStatus> {
        self.gate
            .keys()
            .into_iter()
            .filter_map(|key| {
                let status = self.gate.current(&key)?.status();
                Some((key, status))
            })
            .collect()
    }

    /// Cancels every in-flight fiber and waits up to
    /// `grace` for the gate to drain before returning.
    pub async fn shutdown(&self, grace: Duration) {
        for key in self.gate.keys() {
            if let Some(fiber) = self.gate.current(&key) {
                fiber.cancel_and_exit_callback(|| {});
            }
        }
        let deadline = tokio::time::Instant::now() + grace;
        while !self.gate.keys().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.engine.shutdown();
    }

    fn build_chain(&self, snapshot: &DomainSnapshot) -> StepRef {
        let mut next: StepRef = Arc::new(RollCoordinatorStep { next: Arc::new(TerminalStep) });

        for cluster in snapshot.clusters.iter().rev() {
            for server_name in cluster.server_names().into_iter().rev() {
                let identity = ServerIdentity::clustered(&snapshot.domain_uid, &cluster.name, server_name);
                next = Arc::new(PodStep {
                    ctx: self.pod_ctx.clone(),
                    identity,
                    desired_spec: cluster.server_pod.clone(),
                    next,
                });
            }
        }

        Arc::new(PodStep {
            ctx: self.pod_ctx.clone(),
            identity: snapshot.admin_identity(),
            desired_spec: snapshot.admin_server.pod.clone(),
            next,
        })
    }
}

fn gate_key(snapshot: &DomainSnapshot) -> String {
    format!("{}/{}", snapshot.namespace, snapshot.domain_uid)
}
