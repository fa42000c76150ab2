use crate::util::Error;
use domain_types::{ClusterSpec, Domain, DomainSpec, ServerPodSpec};

/// `(domainUID, clusterName?, serverName)`. The key in every per-server map the
/// kernel keeps. Administrative servers carry `cluster_name: None`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerIdentity {
    pub domain_uid: String,
    pub cluster_name: Option<String>,
    pub server_name: String,
}

impl ServerIdentity {
    pub fn admin(domain_uid: impl Into<String>, server_name: impl Into<String>) -> Self {
        ServerIdentity {
            domain_uid: domain_uid.into(),
            cluster_name: None,
            server_name: server_name.into(),
        }
    }

    pub fn clustered(
        domain_uid: impl Into<String>,
        cluster_name: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        ServerIdentity {
            domain_uid: domain_uid.into(),
            cluster_name: Some(cluster_name.into()),
            server_name: server_name.into(),
        }
    }

    /// The value that lands in the `weblogic.oracle/serverName` label, unique
    /// within the namespace together with `domainUID`.
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.domain_uid, self.server_name)
    }
}

#[derive(Debug, Clone)]
pub struct AdminServerSnapshot {
    pub server_name: String,
    pub pod: ServerPodSpec,
}

#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub name: String,
    pub replicas: u32,
    pub max_unavailable: u32,
    pub server_pod: ServerPodSpec,
}

impl ClusterSnapshot {
    /// Deterministic, ascending order, so a rolling restart always cycles
    /// servers in the same sequence. Managed servers are named `<cluster>-1..=replicas`.
    pub fn server_names(&self) -> Vec<String> {
        (1..=self.replicas)
            .map(|i| format!("{}-{}", self.name, i))
            .collect()
    }
}

/// Immutable view of a Domain's declared state plus derived identity, carried
/// unchanged for the lifetime of a single fiber.
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub domain_uid: String,
    pub namespace: String,
    pub generation: i64,
    pub admin_server: AdminServerSnapshot,
    pub clusters: Vec<ClusterSnapshot>,
    pub introspection_required: bool,
}

impl DomainSnapshot {
    pub fn from_domain(domain: &Domain) -> Result<Self, Error> {
        let namespace = domain
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::Validation("Domain is missing metadata.namespace".to_string()))?;
        let generation = domain.metadata.generation.unwrap_or(0);
        let spec: &DomainSpec = &domain.spec;

        let clusters = spec
            .clusters
            .iter()
            .map(ClusterSnapshot::try_from)
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(DomainSnapshot {
            domain_uid: spec.domain_uid.clone(),
            namespace,
            generation,
            admin_server: AdminServerSnapshot {
                server_name: spec.admin_server.server_name.clone(),
                pod: spec.admin_server.pod.clone(),
            },
            clusters,
            introspection_required: spec.introspection_required,
        })
    }

    pub fn admin_identity(&self) -> ServerIdentity {
        ServerIdentity::admin(&self.domain_uid, &self.admin_server.server_name)
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterSnapshot> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

impl TryFrom<&ClusterSpec> for ClusterSnapshot {
    type Error = Error;

    fn try_from(spec: &ClusterSpec) -> Result<Self, Error> {
        if spec.replicas == 0 {
            return Err(Error::Validation(format!(
                "cluster {} has zero replicas",
                spec.name
            )));
        }
        if spec.max_unavailable == 0 || spec.max_unavailable > spec.replicas {
            return Err(Error::Validation(format!(
                "cluster {} maxUnavailable {} is out of range for {} replicas",
                spec.name, spec.max_unavailable, spec.replicas
            )));
        }
        Ok(ClusterSnapshot {
            name: spec.name.clone(),
            replicas: spec.replicas,
            max_unavailable: spec.max_unavailable,
            server_pod: spec.server_pod.clone(),
        })
    }
}
