use crate::util::Error;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

fn is_ready(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase != Some("Running") {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn is_failed(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed")
}

enum Waiter {
    Ready(oneshot::Sender<Result<(), Error>>),
    Deleted(oneshot::Sender<()>),
}

/// Bridges fiber suspension to Kubernetes watch events. Maintains a
/// per-pod-name list of waiters; each watch event pops and fires every
/// matching waiter for that pod, outside the list's own lock.
pub struct PodWatcher {
    namespace: String,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl PodWatcher {
    pub fn new(namespace: impl Into<String>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(PodWatcher {
            namespace: namespace.into(),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Drives the watch stream until `shutdown` fires. Server-side resync
    /// (kube's `watcher` reconnects and relists automatically) reconciles any
    /// waiters registered during a disconnect against the freshly-listed
    /// state against a resync so missed events are reconciled.
    pub async fn run(self: std::sync::Arc<Self>, api: Api<Pod>, shutdown: CancellationToken) {
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).boxed());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    println!("{}", "🛑 pod watcher shutting down".red());
                    return;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(watcher::Event::Applied(pod))) => self.on_apply(&pod),
                        Some(Ok(watcher::Event::Deleted(pod))) => self.on_delete(pod.name_any().as_str()),
                        Some(Ok(watcher::Event::Restarted(pods))) => {
                            for pod in &pods {
                                self.on_apply(pod);
                            }
                            self.reconcile_missing(&pods);
                        }
                        Some(Err(e)) => eprintln!("{}", format!("pod watch error: {e}").yellow()),
                        None => return,
                    }
                }
            }
        }
    }

    fn on_apply(&self, pod: &Pod) {
        let name = pod.name_any();
        let ready = is_ready(pod);
        let failed = is_failed(pod);
        if !ready && !failed {
            return;
        }
        let fired = {
            let mut waiters = self.waiters.lock().expect("watcher lock poisoned");
            let Some(list) = waiters.get_mut(&name) else { return };
            let mut fired = Vec::new();
            let mut remaining = Vec::new();
            for w in list.drain(..) {
                if matches!(w, Waiter::Ready(_)) {
                    fired.push(w);
                } else {
                    remaining.push(w);
                }
            }
            if remaining.is_empty() {
                waiters.remove(&name);
            } else {
                *list = remaining;
            }
            fired
        };
        for w in fired {
            if let Waiter::Ready(tx) = w {
                let result = if failed {
                    Err(Error::Internal(format!("pod {name} reached phase Failed")))
                } else {
                    Ok(())
                };
                let _ = tx.send(result);
            }
        }
    }

    /// On a `Restarted` relist, any pod-name awaiting deletion that no longer
    /// appears in the relisted set has, in fact, been deleted — this is how a
    /// missed DELETE event during a watch disconnect gets reconciled.
    fn reconcile_missing(&self, relisted: &[Pod]) {
        let present: std::collections::HashSet<String> =
            relisted.iter().map(|p| p.name_any()).collect();
        let missing: Vec<String> = {
            let waiters = self.waiters.lock().expect("watcher lock poisoned");
            waiters
                .keys()
                .filter(|name| !present.contains(*name))
                .cloned()
                .collect()
        };
        for name in missing {
            self.on_delete(&name);
        }
    }

    fn on_delete(&self, name: &str) {
        let mut waiters = self.waiters.lock().expect("watcher lock poisoned");
        let Some(list) = waiters.remove(name) else { return };
        drop(waiters);
        for w in list {
            match w {
                Waiter::Deleted(tx) => {
                    let _ = tx.send(());
                }
                Waiter::Ready(tx) => {
                    let _ = tx.send(Err(Error::Internal(format!("pod {name} was deleted while awaiting readiness"))));
                }
            }
        }
    }

    fn register(&self, name: &str, waiter: Waiter) {
        self.waiters
            .lock()
            .expect("watcher lock poisoned")
            .entry(name.to_string())
            .or_default()
            .push(waiter);
    }

    /// Resumes when `pod_name` reaches `phase=Running` with `Ready=True`, or
    /// fails when it reaches `phase=Failed`. `client` supplies the fast-path
    /// GET so an already-satisfied condition never waits on the watch stream.
    pub async fn wait_for_ready(
        &self,
        client: &dyn super::client::PodClient,
        pod_name: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        if let Some(pod) = client.get(&self.namespace, pod_name).await? {
            if is_ready(&pod) {
                return Ok(());
            }
            if is_failed(&pod) {
                return Err(Error::Internal(format!("pod {pod_name} reached phase Failed")));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.register(pod_name, Waiter::Ready(tx));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal(format!("ready-waiter for {pod_name} dropped"))),
            Err(_) => Err(Error::TimeoutExceeded(format!("pod {pod_name} ready"))),
        }
    }

    /// Resumes on a DELETED event or an initial GET 404.
    pub async fn wait_for_deleted(
        &self,
        client: &dyn super::client::PodClient,
        pod_name: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        if client.get(&self.namespace, pod_name).await?.is_none() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.register(pod_name, Waiter::Deleted(tx));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Internal(format!("delete-waiter for {pod_name} dropped"))),
            Err(_) => Err(Error::TimeoutExceeded(format!("pod {pod_name} deleted"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::client::InMemoryPodClient;

    fn bare_pod(name: &str, phase: &str, ready: bool) -> Pod {
        use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
        use kube::api::ObjectMeta;
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn wait_for_ready_fast_path_when_already_ready() {
        let client = InMemoryPodClient::new();
        client.seed("ns", "p1", bare_pod("p1", "Running", true));
        let watcher = PodWatcher::new("ns");
        watcher
            .wait_for_ready(&client, "p1", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_deleted_fast_path_when_already_gone() {
        let client = InMemoryPodClient::new();
        let watcher = PodWatcher::new("ns");
        watcher
            .wait_for_deleted(&client, "missing", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_ready_resolves_on_apply_event() {
        let client = InMemoryPodClient::new();
        client.seed("ns", "p1", bare_pod("p1", "Pending", false));
        let watcher = PodWatcher::new("ns");
        let w2 = watcher.clone();
        let handle = tokio::spawn(async move {
            let c2 = InMemoryPodClient::new();
            c2.seed("ns", "p1", bare_pod("p1", "Pending", false));
            w2.wait_for_ready(&c2, "p1", Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        watcher.on_apply(&bare_pod("p1", "Running", true));
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_for_deleted_resolves_on_delete_event() {
        let client = InMemoryPodClient::new();
        client.seed("ns", "p1", bare_pod("p1", "Running", true));
        let watcher = PodWatcher::new("ns");
        let w2 = watcher.clone();
        let handle = tokio::spawn(async move {
            let c2 = InMemoryPodClient::new();
            c2.seed("ns", "p1", bare_pod("p1", "Running", true));
            w2.wait_for_deleted(&c2, "p1", Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        watcher.on_delete("p1");
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out() {
        let client = InMemoryPodClient::new();
        client.seed("ns", "p1", bare_pod("p1", "Pending", false));
        let watcher = PodWatcher::new("ns");
        let result = watcher
            .wait_for_ready(&client, "p1", Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::TimeoutExceeded(_))));
    }

    #[tokio::test]
    async fn restarted_relist_reconciles_missing_pod_as_deleted() {
        let client = InMemoryPodClient::new();
        client.seed("ns", "p1", bare_pod("p1", "Running", true));
        let watcher = PodWatcher::new("ns");
        let w2 = watcher.clone();
        let handle = tokio::spawn(async move {
            let c2 = InMemoryPodClient::new();
            c2.seed("ns", "p1", bare_pod("p1", "Running", true));
            w2.wait_for_deleted(&c2, "p1", Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        watcher.reconcile_missing(&[]);
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}
