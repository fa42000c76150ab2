use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_shutdown_timeout_seconds() -> u32 {
    30
}

fn default_max_unavailable() -> u32 {
    1
}

/// CPU/memory requests carried on a server pod. Mirrors the subset of
/// `v1/ResourceRequirements` the kernel cares about for hashing purposes.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ServerResources {
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

impl ServerResources {
    pub fn to_quantities(&self) -> BTreeMap<String, (Option<Quantity>, Option<Quantity>)> {
        let mut out = BTreeMap::new();
        out.insert(
            "cpu".to_string(),
            (
                self.cpu_request.clone().map(Quantity),
                self.cpu_limit.clone().map(Quantity),
            ),
        );
        out.insert(
            "memory".to_string(),
            (
                self.memory_request.clone().map(Quantity),
                self.memory_limit.clone().map(Quantity),
            ),
        );
        out
    }
}

/// Per-server pod configuration shared by the administrative server and every
/// managed server. `image`, `env` and `resources` participate in the pod
/// content hash and so force a roll when changed;
/// `labels`/`annotations` are applied as a live overlay instead — the rest of
/// `v1/Pod` is either server-defaulted or owned outright by the kernel.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ServerPodSpec {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ServerResources,
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct AdminServerSpec {
    pub server_name: String,
    pub pod: ServerPodSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ClusterSpec {
    pub name: String,
    pub replicas: u32,
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: u32,
    /// Overrides layered on top of the domain-wide server pod defaults for
    /// members of this cluster.
    #[serde(default)]
    pub server_pod: ServerPodSpec,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "weblogic.oracle",
    version = "v9",
    kind = "Domain",
    plural = "domains",
    derive = "PartialEq",
    status = "DomainStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.observedGeneration\", \"name\": \"GEN\", \"type\": \"integer\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct DomainSpec {
    pub domain_uid: String,
    pub admin_server: AdminServerSpec,
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
    /// Set by the external DomainProcessor when a topology diff indicates the
    /// introspector must re-run before pod work can proceed. The kernel only
    /// reads this flag as the admin-server rebuild trigger.
    #[serde(default)]
    pub introspection_required: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum DomainPhase {
    #[default]
    Pending,
    Reconciling,
    RollingCluster,
    Available,
    Failed,
}

impl std::fmt::Display for DomainPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DomainPhase::Pending => "Pending",
            DomainPhase::Reconciling => "Reconciling",
            DomainPhase::RollingCluster => "RollingCluster",
            DomainPhase::Available => "Available",
            DomainPhase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Condition type names surfaced on `Domain.status.conditions`.
pub mod condition_types {
    pub const COMPLETED: &str = "Completed";
    pub const AVAILABLE: &str = "Available";
    pub const FAILED: &str = "Failed";
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DomainStatus {
    pub phase: DomainPhase,
    /// The `metadata.generation` that this status reflects.
    pub observed_generation: i64,
    pub message: Option<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resources_yield_no_quantities() {
        let r = ServerResources::default();
        let q = r.to_quantities();
        assert!(q["cpu"].0.is_none());
        assert!(q["memory"].0.is_none());
    }

    #[test]
    fn resources_round_trip_into_quantities() {
        let r = ServerResources {
            cpu_request: Some("250m".to_string()),
            memory_request: Some("256Mi".to_string()),
            cpu_limit: None,
            memory_limit: Some("512Mi".to_string()),
        };
        let q = r.to_quantities();
        assert_eq!(q["cpu"].0.as_ref().unwrap().0, "250m");
        assert!(q["cpu"].1.is_none());
        assert_eq!(q["memory"].1.as_ref().unwrap().0, "512Mi");
    }
}
