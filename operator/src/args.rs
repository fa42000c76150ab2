use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Namespace this operator instance owns. Keeps RBAC namespaced rather
    /// than cluster-scoped, and sidesteps needing leader election since one
    /// replica per namespace is the deployment model.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// HTTP port serving /healthz, /readyz and /metrics.
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Worker budget handed to the kernel's Engine.
    #[arg(long, env = "WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Grace period given to in-flight fibers on shutdown.
    #[arg(long, env = "SHUTDOWN_GRACE_SECONDS", default_value_t = 30)]
    pub shutdown_grace_seconds: u64,
}
