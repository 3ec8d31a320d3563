use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Fields that participate in the fingerprint. Everything else in the body
/// (metadata, client-side options) is deliberately ignored so cosmetic
/// differences do not defeat deduplication.
const SIGNATURE_FIELDS: &[&str] = &[
    "model",
    "messages",
    "system",
    "tools",
    "temperature",
    "top_p",
    "top_k",
    "stream",
];

/// Deterministic fingerprint of a normalized request body.
///
/// `serde_json` maps are ordered, so re-serializing the extracted subset
/// yields a canonical rendering: two bodies that differ only in key order or
/// whitespace hash identically. `max_tokens` joins the hash only when the
/// operator opted in.
pub fn request_fingerprint(body: &Value, include_max_tokens: bool) -> String {
    let mut subset = Map::new();
    if let Some(obj) = body.as_object() {
        for field in SIGNATURE_FIELDS {
            if let Some(value) = obj.get(*field) {
                subset.insert((*field).to_string(), value.clone());
            }
        }
        if include_max_tokens {
            if let Some(value) = obj.get("max_tokens") {
                subset.insert("max_tokens".to_string(), value.clone());
            }
        }
    }
    let canonical = Value::Object(subset).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
