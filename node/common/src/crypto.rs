use sha2::{Digest, Sha256};
use ethers::types::H256;

/// Compute SHA256 hash
pub fn sha256(data: &[u8]) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Result fingerprint: hex SHA256 over the canonical JSON payload followed by the job id.
pub fn fingerprint(payload: &serde_json::Value, job_id: &str) -> String {
    let mut preimage = canonical_json(payload).into_bytes();
    preimage.extend_from_slice(job_id.as_bytes());
    hex::encode(sha256(&preimage).as_bytes())
}

/// Compact JSON with object keys sorted at every level
pub fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        scalar => scalar.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_hashes_payload_then_job_id() {
        let fp = fingerprint(&json!({"b": 2, "a": 1}), "7");
        assert_eq!(fp, hex::encode(sha256(br#"{"a":1,"b":2}7"#).as_bytes()));
    }

    #[test]
    fn fingerprint_is_fixed_length_hex() {
        let fp = fingerprint(&json!({"type": "generic"}), "1");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_stable_and_key_order_independent() {
        let a = json!({"a": 1, "b": [1, 2, 3]});
        let b: serde_json::Value = serde_json::from_str(r#"{"b": [1, 2, 3], "a": 1}"#).unwrap();
        assert_eq!(fingerprint(&a, "7"), fingerprint(&b, "7"));
    }

    #[test]
    fn fingerprint_binds_job_id() {
        let payload = json!({"type": "generic"});
        assert_ne!(fingerprint(&payload, "1"), fingerprint(&payload, "2"));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc").as_bytes()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
