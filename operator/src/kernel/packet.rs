use crate::kernel::step::StepRef;
use crate::model::DomainSnapshot;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Parsed introspector output. Producing it is out of scope here; the kernel only
/// ever reads it as an opaque black box ("produce topology or fail").
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub server_names: Vec<String>,
}

/// A roll a managed-pod step has surrendered to the coordinator, keyed by
/// server name under `servers-to-roll`. `cycle` re-enters the pod-lifecycle READ step
/// once the coordinator's budget admits this server.
#[derive(Clone)]
pub struct DeferredRoll {
    pub cycle: StepRef,
    pub packet: Packet,
}

/// The per-fiber context bag threaded through every step of one workflow
/// Replaces an untyped map with the well-known keys the
/// kernel actually reads: the domain snapshot, topology, the cluster a
/// managed-pod step is currently working on, and the servers-to-roll map.
#[derive(Clone)]
pub struct Packet {
    pub snapshot: Arc<DomainSnapshot>,
    pub topology: Topology,
    pub current_cluster: Option<String>,
    servers_to_roll: Arc<Mutex<BTreeMap<String, DeferredRoll>>>,
}

impl Packet {
    pub fn new(snapshot: DomainSnapshot, topology: Topology) -> Self {
        Packet {
            snapshot: Arc::new(snapshot),
            topology,
            current_cluster: None,
            servers_to_roll: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn for_cluster(&self, cluster_name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.current_cluster = Some(cluster_name.into());
        copy
    }

    /// Deep-copies the map and its lock — used when enqueueing
    /// a deferred roll so the coordinator's later mutations never alias the
    /// packet the pod step continues with.
    pub fn copy(&self) -> Self {
        let roll_map = self.servers_to_roll.lock().expect("packet monitor poisoned").clone();
        Packet {
            snapshot: self.snapshot.clone(),
            topology: self.topology.clone(),
            current_cluster: self.current_cluster.clone(),
            servers_to_roll: Arc::new(Mutex::new(roll_map)),
        }
    }

    /// The packet instance serves as its own monitor for this map.
    pub fn defer_roll(&self, server_name: impl Into<String>, deferred: DeferredRoll) {
        self.servers_to_roll
            .lock()
            .expect("packet monitor poisoned")
            .insert(server_name.into(), deferred);
    }

    pub fn take_servers_to_roll(&self) -> BTreeMap<String, DeferredRoll> {
        std::mem::take(&mut *self.servers_to_roll.lock().expect("packet monitor poisoned"))
    }

    pub fn servers_to_roll_len(&self) -> usize {
        self.servers_to_roll.lock().expect("packet monitor poisoned").len()
    }
}
