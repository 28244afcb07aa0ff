// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Canonical JSON encoding and stable SHA-256 digests.
//!
//! Every `*_digest` in the evidence pack is computed over the canonical
//! encoding (recursively sorted object keys, compact separators) so that
//! byte-identical inputs always recompute to the same value.

use crate::error::{HarnessError, HarnessResult};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub fn sort_json(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, val) in entries {
                sorted.insert(k, sort_json(val));
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json).collect()),
        other => other,
    }
}

pub fn canonical_json(v: &impl Serialize) -> HarnessResult<Vec<u8>> {
    let value = serde_json::to_value(v).map_err(|_| HarnessError::Internal)?;
    let sorted = sort_json(value);
    serde_json::to_vec(&sorted).map_err(|_| HarnessError::Internal)
}

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    hex::encode(h.finalize())
}

/// Stable digest of any JSON-serializable value.
pub fn stable_sha256(v: &impl Serialize) -> HarnessResult<String> {
    Ok(sha256_bytes(&canonical_json(v)?))
}

pub fn sha256_file(path: &Path) -> HarnessResult<String> {
    let mut file = File::open(path)?;
    let mut h = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(hex::encode(h.finalize()))
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Truncated token hash used wherever a secret value must be referenced
/// without storing it (canary scans, consent tokens, recipients).
pub fn token_hash_prefix(token: &str) -> String {
    let full = sha256_bytes(token.as_bytes());
    full[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": [ {"y": 0, "x": 1} ]});
        let bytes = canonical_json(&v).expect("canonical");
        assert_eq!(
            String::from_utf8(bytes).expect("utf8"),
            r#"{"a":[{"x":1,"y":0}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn stable_sha256_is_order_insensitive() {
        let a = json!({"k1": 1, "k2": [1, 2]});
        let b = json!({"k2": [1, 2], "k1": 1});
        assert_eq!(
            stable_sha256(&a).expect("a"),
            stable_sha256(&b).expect("b")
        );
    }

    #[test]
    fn token_hash_prefix_is_short_and_stable() {
        let p = token_hash_prefix("CANARY-abc123");
        assert_eq!(p.len(), 16);
        assert_eq!(p, token_hash_prefix("CANARY-abc123"));
        assert_ne!(p, token_hash_prefix("CANARY-abc124"));
    }

    proptest! {
        #[test]
        fn digest_is_stable_across_recomputation(
            keys in proptest::collection::vec("[a-z]{1,8}", 1..8),
            vals in proptest::collection::vec(0i64..1000, 1..8),
        ) {
            let mut m = serde_json::Map::new();
            for (k, v) in keys.iter().zip(vals.iter()) {
                m.insert(k.clone(), json!(v));
            }
            let v = Value::Object(m);
            let d1 = stable_sha256(&v).expect("d1");
            let d2 = stable_sha256(&v).expect("d2");
            prop_assert_eq!(&d1, &d2);
            prop_assert!(is_sha256_hex(&d1));
        }
    }
}
