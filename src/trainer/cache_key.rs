//! Deterministic content key for training requests. Two requests with the
//! same logical parameters hash to the same key regardless of process or
//! parameter insertion order.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Computes the lowercase hex SHA-256 of the canonical JSON form of
/// `{linkRef, modelName, time, modelParameters}`. serde_json maps iterate
/// in key order, so the serialization is canonical.
pub fn cache_key(
    link_ref: &str,
    model_name: &str,
    reference_time: DateTime<Utc>,
    parameters: &Value,
) -> String {
    let canonical = json!({
        "linkRef": link_ref,
        "modelName": model_name,
        "time": reference_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        "modelParameters": parameters,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
