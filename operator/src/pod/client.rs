use crate::util::Error;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;

/// Thin interface over `v1/Pod` CRUD. The HTTP client to the Kubernetes API is
/// explicitly out of scope here; the kernel calls it only through this trait,
/// which is also what lets the pod-lifecycle decision logic be tested without
/// a cluster.
#[async_trait]
pub trait PodClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;
    async fn create(&self, namespace: &str, pod: Pod) -> Result<Pod, Error>;
    /// JSON-Patch only; JSON-Merge-Patch would risk nulling server-defaulted fields.
    async fn patch(&self, namespace: &str, name: &str, patch: json_patch::Patch) -> Result<Pod, Error>;
    async fn delete(&self, namespace: &str, name: &str, grace_period_seconds: i64) -> Result<(), Error>;
}

pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    pub fn new(client: Client) -> Self {
        KubePodClient { client }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        match self.api(namespace).get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, namespace: &str, pod: Pod) -> Result<Pod, Error> {
        Ok(self.api(namespace).create(&PostParams::default(), &pod).await?)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: json_patch::Patch) -> Result<Pod, Error> {
        let patch = Patch::Json::<Pod>(patch);
        Ok(self
            .api(namespace)
            .patch(name, &PatchParams::apply(crate::util::MANAGER_NAME), &patch)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str, grace_period_seconds: i64) -> Result<(), Error> {
        let dp = DeleteParams::foreground().grace_period(grace_period_seconds.max(0) as u32);
        match self.api(namespace).delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub use mock::InMemoryPodClient;

#[cfg(test)]
mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryPodClient {
        pods: Mutex<HashMap<(String, String), Pod>>,
    }

    impl InMemoryPodClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, namespace: &str, name: &str, pod: Pod) {
            self.pods
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), pod);
        }
    }

    #[async_trait]
    impl PodClient for InMemoryPodClient {
        async fn get(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
            Ok(self
                .pods
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn create(&self, namespace: &str, pod: Pod) -> Result<Pod, Error> {
            let name = pod.metadata.name.clone().expect("pod must have a name to create");
            self.pods
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), pod.clone());
            Ok(pod)
        }

        async fn patch(&self, namespace: &str, name: &str, patch: json_patch::Patch) -> Result<Pod, Error> {
            let mut pods = self.pods.lock().unwrap();
            let key = (namespace.to_string(), name.to_string());
            let pod = pods
                .get(&key)
                .ok_or_else(|| Error::Kube { source: not_found() })?;
            let mut value = serde_json::to_value(pod).map_err(Error::from)?;
            json_patch::patch(&mut value, &patch).map_err(|e| Error::Internal(e.to_string()))?;
            let updated: Pod = serde_json::from_value(value).map_err(Error::from)?;
            pods.insert(key, updated.clone());
            Ok(updated)
        }

        async fn delete(&self, namespace: &str, name: &str, _grace_period_seconds: i64) -> Result<(), Error> {
            self.pods
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
            Ok(())
        }
    }

    fn not_found() -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        })
    }
}
