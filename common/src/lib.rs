pub mod shutdown;

#[cfg(feature = "metrics")]
pub mod metrics;

pub fn signal_ready() {
    let _ = std::fs::write("/tmp/ready", "ready");
}

/// Labels and annotations the kernel owns. Every write the kernel makes to a Pod
/// carries exactly these keys; nothing else in the cluster is permitted to set them.
pub mod labels {
    pub const DOMAIN_UID: &str = "weblogic.oracle/domainUID";
    pub const CLUSTER_NAME: &str = "weblogic.oracle/clusterName";
    pub const SERVER_NAME: &str = "weblogic.oracle/serverName";
    pub const TO_BE_ROLLED: &str = "weblogic.oracle/to-be-rolled";
}

pub mod annotations {
    pub const POD_HASH: &str = "weblogic.oracle/pod-hash";
    pub const CREATED_BY: &str = "weblogic.oracle/created-by";
}

pub const MANAGER_NAME: &str = "weblogic-domain-operator";
