//! Layered YAML configuration loading, canonicalization and hashing, plus
//! secret handling that keeps operator tokens and exchange credentials out
//! of the canonical/hashed document and out of any `Debug`/`Display` output.

mod error;
mod risk_limits;
pub mod secrets;

pub use error::ConfigError;
pub use risk_limits::parse_risk_limits;
pub use secrets::Secret;

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge (base -> environment
/// -> operator overrides).
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig, ConfigError> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).map_err(|source| ConfigError::Io {
            path: p.to_string(),
            source,
        })?;
        let yaml_val: serde_yaml::Value = serde_yaml::from_str(&s).map_err(|e| ConfigError::Yaml {
            path: p.to_string(),
            message: e.to_string(),
        })?;
        let json_val = serde_json::to_value(yaml_val).map_err(|e| ConfigError::Json {
            message: e.to_string(),
        })?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).map_err(|e| ConfigError::Json {
            message: e.to_string(),
        })?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Deep-merge: objects merge recursively; arrays and scalars overwrite.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON, so the same logical config always hashes identically.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
