//! Template content hashing

use crate::error::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Stable fingerprint of a serializable value.
///
/// Object keys are sorted before hashing so the result does not depend on map
/// ordering. Not suitable for anything security related.
pub fn compute_hash<T: Serialize>(obj: &T) -> Result<String> {
    let canonical = canonicalize(serde_json::to_value(obj)?);
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..8]))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ContainerResourceRequirements, InstanceTemplateSpec, SandboxContainer, SandboxRuntime,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use serde_json::json;

    fn template(image: &str) -> InstanceTemplateSpec {
        let mut template = InstanceTemplateSpec::default();
        template.spec.runtime.sandbox = Some(SandboxRuntime {
            containers: vec![SandboxContainer {
                name: "app".to_string(),
                image: image.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        template
    }

    #[test]
    fn test_hash_is_stable() {
        let a = compute_hash(&template("nginx:1.27")).unwrap();
        let b = compute_hash(&template("nginx:1.27")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = compute_hash(&template("nginx:1.27")).unwrap();
        let b = compute_hash(&template("nginx:1.28")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_changes_with_container_resources() {
        let with_limit = |cpu: &str| {
            let mut template = template("nginx:1.27");
            if let Some(sandbox) = template.spec.runtime.sandbox.as_mut() {
                sandbox.containers[0].resources = Some(ContainerResourceRequirements {
                    limits: [("cpu".to_string(), Quantity(cpu.to_string()))].into(),
                    ..Default::default()
                });
            }
            template
        };

        let base = compute_hash(&template("nginx:1.27")).unwrap();
        let one = compute_hash(&with_limit("1")).unwrap();
        let two = compute_hash(&with_limit("2")).unwrap();
        assert_ne!(base, one);
        assert_ne!(one, two);
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": {"x": 1, "y": 2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": {"y": 2, "x": 1}, "a": 1}"#).unwrap();
        assert_eq!(compute_hash(&a).unwrap(), compute_hash(&b).unwrap());
        assert_ne!(compute_hash(&a).unwrap(), compute_hash(&json!({"a": 2})).unwrap());
    }
}
