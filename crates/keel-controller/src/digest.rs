//! Managed digest of an object's desired state
//!
//! The apply engine stamps every object it writes with a hash of the fields it
//! manages. When the stored hash equals the hash of the freshly computed
//! desired object, the live object is already converged and no write happens.
//!
//! Which fields take part is an explicit, per-kind [`DigestConfig`]. Server
//! managed metadata, `status` and the digest annotation itself never do.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use kube::Resource;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha512};

use keel_common::{Error, MANAGED_HASH_ANNOTATION};

/// Metadata fields owned by the API server
const SERVER_METADATA_FIELDS: &[&str] = &[
    "uid",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "managedFields",
    "selfLink",
];

/// Fields of one kind that take part in its digest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DigestConfig {
    /// Drop `metadata.finalizers` before hashing
    pub exclude_finalizers: bool,
    /// Further fields to drop, as JSON pointers (e.g. `/spec/replicas`)
    pub excluded_paths: Vec<String>,
}

impl Default for DigestConfig {
    /// Finalizers participate; no extra exclusions
    fn default() -> Self {
        Self {
            exclude_finalizers: false,
            excluded_paths: Vec::new(),
        }
    }
}

impl DigestConfig {
    /// Drop `metadata.finalizers` before hashing
    pub fn excluding_finalizers(mut self) -> Self {
        self.exclude_finalizers = true;
        self
    }

    /// Drop the field at `pointer` before hashing
    pub fn excluding(mut self, pointer: impl Into<String>) -> Self {
        self.excluded_paths.push(pointer.into());
        self
    }

    /// Hash of the managed fields of `obj`: base64 of SHA-512 over canonical JSON
    pub fn compute<K: Resource + Serialize>(&self, obj: &K) -> keel_common::Result<String> {
        let mut value = serde_json::to_value(obj)?;
        self.strip(&mut value)?;

        let mut canonical = String::new();
        write_canonical(&value, &mut canonical)?;

        let hash = Sha512::digest(canonical.as_bytes());
        Ok(STANDARD.encode(hash))
    }

    fn strip(&self, value: &mut Value) -> keel_common::Result<()> {
        let root = value.as_object_mut().ok_or_else(|| {
            Error::serialization("object does not serialize to a JSON map")
        })?;
        root.remove("status");

        if let Some(Value::Object(meta)) = root.get_mut("metadata") {
            for field in SERVER_METADATA_FIELDS {
                meta.remove(*field);
            }
            if self.exclude_finalizers {
                meta.remove("finalizers");
            }
            remove_key_and_prune(meta, "annotations", MANAGED_HASH_ANNOTATION);
        }

        for pointer in &self.excluded_paths {
            remove_pointer(value, pointer);
        }
        Ok(())
    }
}

/// Digest of `obj` as currently stored on it
pub fn stored_digest<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()?
        .get(MANAGED_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Store `digest` on `obj`
pub fn set_digest<K: Resource>(obj: &mut K, digest: String) {
    obj.meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(MANAGED_HASH_ANNOTATION.to_string(), digest);
}

/// Remove `key` from the map at `meta[field]`, dropping the map when it empties
///
/// An absent map and an empty one hash the same.
fn remove_key_and_prune(meta: &mut Map<String, Value>, field: &str, key: &str) {
    let empty = match meta.get_mut(field) {
        Some(Value::Object(map)) => {
            map.remove(key);
            map.is_empty()
        }
        Some(Value::Null) => true,
        _ => false,
    };
    if empty {
        meta.remove(field);
    }
}

fn remove_pointer(value: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let last = last.replace("~1", "/").replace("~0", "~");
    match value.pointer_mut(parent) {
        Some(Value::Object(map)) => {
            map.remove(&last);
        }
        Some(Value::Array(items)) => {
            if let Ok(idx) = last.parse::<usize>() {
                if idx < items.len() {
                    items.remove(idx);
                }
            }
        }
        _ => {}
    }
}

/// JSON with object keys sorted at every level
fn write_canonical(value: &Value, out: &mut String) -> keel_common::Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cfg".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some([("app".to_string(), "db".to_string())].into()),
                finalizers: Some(vec!["keel.dev/cleanup".to_string()]),
                ..Default::default()
            },
            data: Some([("scylla.yaml".to_string(), "cluster_name: a".to_string())].into()),
            ..Default::default()
        }
    }

    fn digest(obj: &ConfigMap) -> String {
        DigestConfig::default().compute(obj).unwrap()
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest(&config_map()), digest(&config_map()));
        // base64 of 64 bytes
        assert_eq!(digest(&config_map()).len(), 88);
    }

    #[test]
    fn server_metadata_does_not_change_the_digest() {
        let base = digest(&config_map());

        let mut cm = config_map();
        cm.metadata.uid = Some("1234".to_string());
        cm.metadata.resource_version = Some("42".to_string());
        cm.metadata.generation = Some(7);
        cm.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        cm.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(digest(&cm), base);
    }

    #[test]
    fn digest_annotation_does_not_change_the_digest() {
        let base = digest(&config_map());

        let mut cm = config_map();
        set_digest(&mut cm, "previous".to_string());
        assert_eq!(stored_digest(&cm), Some("previous"));
        assert_eq!(digest(&cm), base);

        // Other annotations do participate
        cm.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "storage".to_string());
        assert_ne!(digest(&cm), base);
    }

    #[test]
    fn status_does_not_change_the_digest() {
        let sts = StatefulSet {
            metadata: ObjectMeta {
                name: Some("db".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: None,
        };
        let mut with_status = sts.clone();
        with_status.status = Some(StatefulSetStatus {
            ready_replicas: Some(2),
            ..Default::default()
        });

        let config = DigestConfig::default();
        assert_eq!(
            config.compute(&sts).unwrap(),
            config.compute(&with_status).unwrap()
        );
    }

    #[test]
    fn managed_content_changes_the_digest() {
        let base = digest(&config_map());

        let mut cm = config_map();
        cm.data
            .get_or_insert_with(Default::default)
            .insert("scylla.yaml".to_string(), "cluster_name: b".to_string());
        assert_ne!(digest(&cm), base);

        let mut cm = config_map();
        cm.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("tier".to_string(), "data".to_string());
        assert_ne!(digest(&cm), base);
    }

    #[test]
    fn finalizers_participate_unless_excluded() {
        let mut without = config_map();
        without.metadata.finalizers = None;

        assert_ne!(digest(&config_map()), digest(&without));

        let config = DigestConfig::default().excluding_finalizers();
        assert_eq!(
            config.compute(&config_map()).unwrap(),
            config.compute(&without).unwrap()
        );
    }

    #[test]
    fn excluded_paths_are_ignored() {
        let config = DigestConfig::default().excluding("/spec/replicas");
        let mut a = StatefulSet::default();
        a.spec = Some(StatefulSetSpec {
            replicas: Some(1),
            ..Default::default()
        });
        let mut b = a.clone();
        if let Some(spec) = b.spec.as_mut() {
            spec.replicas = Some(5);
        }
        assert_eq!(config.compute(&a).unwrap(), config.compute(&b).unwrap());
        assert_ne!(
            DigestConfig::default().compute(&a).unwrap(),
            DigestConfig::default().compute(&b).unwrap()
        );
    }

    #[test]
    fn empty_and_missing_annotations_hash_the_same() {
        let mut empty = config_map();
        empty.metadata.annotations = Some(Default::default());
        assert_eq!(digest(&empty), digest(&config_map()));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value: Value = serde_json::from_str(r#"{"b":1,"a":{"d":[2,{"z":1,"y":2}],"c":null}}"#)
            .unwrap();
        let mut out = String::new();
        write_canonical(&value, &mut out).unwrap();
        assert_eq!(out, r#"{"a":{"c":null,"d":[2,{"y":2,"z":1}]},"b":1}"#);
    }
}
