use domain_types::ServerPodSpec;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// The subset of a server pod spec that forces a ROLL when it changes.
/// User-supplied `labels`/`annotations` are deliberately
/// excluded — only the kernel-owned identity labels participate in identity,
/// and those never change shape for a live server, so they add nothing to
/// the hash surface. `shutdown_timeout_seconds` is excluded too: it only
/// tunes the delete-phase grace period, the pod-lifecycle equivalent
/// of a probe timeout, and is itself non-hashed.
#[derive(Serialize)]
struct HashedFields<'a> {
    image: &'a str,
    env: &'a BTreeMap<String, String>,
    resources: &'a domain_types::ServerResources,
}

/// Stable SHA-256 over a canonical encoding of `spec`'s hashed fields.
/// `BTreeMap` already iterates and serializes in sorted
/// key order, so map-valued fields hash identically under any permutation of
/// their original insertion order.
pub fn pod_hash(spec: &ServerPodSpec) -> String {
    let hashed = HashedFields {
        image: &spec.image,
        env: &spec.env,
        resources: &spec.resources,
    };
    let canonical = serde_json::to_vec(&hashed).expect("hashed fields always serialize");
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_env(pairs: &[(&str, &str)]) -> ServerPodSpec {
        ServerPodSpec {
            image: "weblogic:14.1.1".to_string(),
            env: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_stable_under_map_key_permutation() {
        let a = spec_with_env(&[("A", "1"), ("B", "2"), ("C", "3")]);
        let b = spec_with_env(&[("C", "3"), ("A", "1"), ("B", "2")]);
        assert_eq!(pod_hash(&a), pod_hash(&b));
    }

    #[test]
    fn hash_changes_when_image_changes() {
        let mut a = spec_with_env(&[]);
        let h1 = pod_hash(&a);
        a.image = "weblogic:14.1.2".to_string();
        assert_ne!(h1, pod_hash(&a));
    }

    #[test]
    fn hash_ignores_shutdown_timeout() {
        let mut a = spec_with_env(&[]);
        let h1 = pod_hash(&a);
        a.shutdown_timeout_seconds = 999;
        assert_eq!(h1, pod_hash(&a));
    }

    #[test]
    fn hash_ignores_annotation_only_changes() {
        let mut a = spec_with_env(&[]);
        let h1 = pod_hash(&a);
        a.annotations.insert("foo".to_string(), "bar".to_string());
        assert_eq!(h1, pod_hash(&a));
    }
}
