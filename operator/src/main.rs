use anyhow::Result;
use clap::Parser;
use domain_operator::args::Cli;
use domain_operator::kernel::Engine;
use domain_operator::pod::{KubePodClient, PodClient, PodStepContext, PodWatcher};
use domain_operator::processor::Processor;
use domain_operator::reconcile;
use kube::{Client, api::Api};
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let client = Client::try_default()
        .await
        .expect("expected a valid KUBECONFIG or in-cluster service account");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        domain_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    #[cfg(feature = "metrics")]
    {
        let metrics_port = args.metrics_port;
        let registry = prometheus::Registry::new();
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(async move { domain_common::metrics::serve(metrics_port, registry, metrics_shutdown).await });
    }

    let pod_client: Arc<dyn PodClient> = Arc::new(KubePodClient::new(client.clone()));
    let watcher = PodWatcher::new(args.namespace.clone());
    let watcher_for_run = watcher.clone();
    let pods_api: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), &args.namespace);
    let watcher_shutdown = shutdown.clone();
    tokio::spawn(async move { watcher_for_run.run(pods_api, watcher_shutdown).await });

    let pod_ctx = PodStepContext::new(pod_client, watcher, args.namespace.clone());
    let workers = if args.workers == 0 {
        Engine::with_default_workers()
    } else {
        Engine::new(args.workers)
    };
    let processor = Arc::new(Processor::new(workers, pod_ctx));

    domain_common::signal_ready();
    println!("{}", "domain-operator ready".green());

    let grace = Duration::from_secs(args.shutdown_grace_seconds);
    let processor_for_shutdown = processor.clone();
    let shutdown_for_wait = shutdown.clone();
    let controller = tokio::spawn(async move {
        reconcile::run(client, &args.namespace, processor, shutdown).await;
    });

    shutdown_for_wait.cancelled().await;
    let _ = controller.await;
    processor_for_shutdown.shutdown(grace).await;

    Ok(())
}
