use crate::kernel::{DeferredRoll, NextAction, Packet, Step, StepRef, run_chain};
use crate::model::DomainSnapshot;
use crate::util::Error;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Drains the servers-to-roll map and cycles every deferred server, bounding
/// concurrent not-ready pods per cluster to that cluster's `maxUnavailable`.
/// Runs once per fiber, after every pod-step-context has had a chance
/// to defer.
pub struct RollCoordinatorStep {
    pub next: StepRef,
}

#[async_trait]
impl Step for RollCoordinatorStep {
    async fn run(&self, packet: &mut Packet) -> NextAction {
        let deferred = packet.take_servers_to_roll();
        if deferred.is_empty() {
            return NextAction::Advance(self.next.clone());
        }

        let snapshot = packet.snapshot.clone();
        let next = self.next.clone();
        NextAction::suspend_on(async move {
            match run_all_clusters(&snapshot, deferred).await {
                Ok(()) => NextAction::Advance(next),
                Err(e) => NextAction::Throw(e),
            }
        })
    }

    fn name(&self) -> &str {
        "roll-coordinator"
    }
}

/// `servers-to-roll` is a `BTreeMap`, so iteration is already in ascending
/// server-name order; grouping by cluster below preserves that order within
/// each group.
async fn run_all_clusters(
    snapshot: &DomainSnapshot,
    deferred: BTreeMap<String, DeferredRoll>,
) -> Result<(), Error> {
    let mut by_cluster: BTreeMap<String, Vec<DeferredRoll>> = BTreeMap::new();
    for (server_name, roll) in deferred {
        let cluster_name = snapshot
            .clusters
            .iter()
            .find(|c| c.server_names().contains(&server_name))
            .map(|c| c.name.clone());
        let Some(cluster_name) = cluster_name else {
            // A server no longer in any cluster snapshot (e.g. cluster shrank
            // after being labeled to-be-rolled) has nothing left to roll into.
            continue;
        };
        by_cluster.entry(cluster_name).or_default().push(roll);
    }

    let cluster_rolls = by_cluster.into_iter().map(|(cluster_name, rolls)| {
        let max_unavailable = snapshot
            .cluster(&cluster_name)
            .map(|c| c.max_unavailable.max(1))
            .unwrap_or(1);
        run_cluster_roll(rolls, max_unavailable)
    });

    stream::iter(cluster_rolls)
        .buffer_unordered(usize::MAX)
        .try_collect::<Vec<()>>()
        .await?;
    Ok(())
}

/// Runs every deferred cycle for one cluster with at most `max_unavailable`
/// in flight at a time.
async fn run_cluster_roll(rolls: Vec<DeferredRoll>, max_unavailable: u32) -> Result<(), Error> {
    stream::iter(rolls.into_iter().map(|roll| async move {
        let mut packet = roll.packet;
        run_chain(roll.cycle, &mut packet).await
    }))
    .buffer_unordered(max_unavailable as usize)
    .try_collect::<Vec<()>>()
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{NextAction, Step};
    use crate::model::{AdminServerSnapshot, ClusterSnapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingStep {
        name: String,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Step for RecordingStep {
        async fn run(&self, _packet: &mut Packet) -> NextAction {
            self.order.lock().unwrap().push(self.name.clone());
            NextAction::Terminate
        }
        fn name(&self) -> &str {
            "recording"
        }
    }

    fn snapshot_with_cluster(max_unavailable: u32) -> DomainSnapshot {
        DomainSnapshot {
            domain_uid: "d1".to_string(),
            namespace: "ns".to_string(),
            generation: 1,
            admin_server: AdminServerSnapshot { server_name: "admin".to_string(), pod: Default::default() },
            clusters: vec![ClusterSnapshot {
                name: "c1".to_string(),
                replicas: 3,
                max_unavailable,
                server_pod: Default::default(),
            }],
            introspection_required: false,
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

    #[tokio::test]
    async fn empty_roll_map_advances_immediately() {
        let step = RollCoordinatorStep { next: Arc::new(TerminalNext) };
        let mut packet = Packet::new(snapshot_with_cluster(1), Default::default());
        let action = step.run(&mut packet).await;
        assert!(matches!(action, NextAction::Advance(_)));
    }

    #[tokio::test]
    async fn drains_all_deferred_servers() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let packet = Packet::new(snapshot_with_cluster(2), Default::default());
        for name in ["c1-1", "c1-2", "c1-3"] {
            packet.defer_roll(
                name,
                DeferredRoll {
                    cycle: Arc::new(RecordingStep { name: name.to_string(), order: order.clone() }),
                    packet: packet.copy(),
                },
            );
        }
        let step = RollCoordinatorStep { next: Arc::new(TerminalNext) };
        let mut packet = packet;
        let action = step.run(&mut packet).await;
        let NextAction::Suspend(fut) = action else { panic!("expected suspend") };
        let resolved = fut.await;
        assert!(matches!(resolved, NextAction::Advance(_)));
        let mut done = order.lock().unwrap().clone();
        done.sort();
        assert_eq!(done, vec!["c1-1", "c1-2", "c1-3"]);
    }

    #[tokio::test]
    async fn counts_concurrent_cycles_never_above_max_unavailable() {
        struct ConcurrencyCappedStep {
            active: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Step for ConcurrencyCappedStep {
            async fn run(&self, _packet: &mut Packet) -> NextAction {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                NextAction::Terminate
            }
            fn name(&self) -> &str {
                "capped"
            }
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let packet = Packet::new(snapshot_with_cluster(1), Default::default());
        for name in ["c1-1", "c1-2", "c1-3"] {
            packet.defer_roll(
                name,
                DeferredRoll {
                    cycle: Arc::new(ConcurrencyCappedStep { active: active.clone(), peak: peak.clone() }),
                    packet: packet.copy(),
                },
            );
        }
        let step = RollCoordinatorStep { next: Arc::new(TerminalNext) };
        let mut packet = packet;
        let action = step.run(&mut packet).await;
        let NextAction::Suspend(fut) = action else { panic!("expected suspend") };
        fut.await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
