//! HMAC audit signing (C4).
//!
//! Canonical JSON (sorted keys, no whitespace, no trailing newline) of
//! `{requestId, tool, payload ∪ {serverTs}}` is the HMAC input; the
//! resulting signature is base64-encoded and paired with a fresh nonce
//! that is remembered for an hour to reject replays.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditSignature {
    #[serde(rename = "auditSig")]
    pub audit_sig: String,
    pub nonce: String,
    #[serde(rename = "serverTs")]
    pub server_ts: String,
}

/// Converts arbitrary JSON into a canonical (sorted-key, no-whitespace)
/// string. Used only as HMAC input, never round-tripped back into JSON.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.iter().map(|(k, v)| (k.clone(), sorted(v))).collect();
                serde_json::to_value(sorted).unwrap()
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sorted(value)).expect("serializable json")
}

pub struct AuditSigner {
    secret: Vec<u8>,
    seen_nonces: Mutex<HashMap<String, Instant>>,
}

impl AuditSigner {
    pub fn new(secret: &str) -> Result<Self, AuditError> {
        if secret.is_empty() {
            return Err(AuditError::InvalidKey);
        }
        Ok(AuditSigner {
            secret: secret.as_bytes().to_vec(),
            seen_nonces: Mutex::new(HashMap::new()),
        })
    }

    pub fn sign(&self, request_id: &str, tool: &str, payload: &Value) -> AuditSignature {
        let server_ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut full_payload = payload.clone();
        if let Value::Object(ref mut map) = full_payload {
            map.insert("serverTs".to_string(), Value::String(server_ts.clone()));
        }

        let record = serde_json::json!({
            "requestId": request_id,
            "tool": tool,
            "payload": full_payload,
        });
        let canonical = canonical_json(&record);

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(canonical.as_bytes());
        let sig = BASE64.encode(mac.finalize().into_bytes());

        let nonce = uuid::Uuid::new_v4().to_string();
        self.remember_nonce(&nonce);

        AuditSignature {
            audit_sig: sig,
            nonce,
            server_ts,
        }
    }

    fn remember_nonce(&self, nonce: &str) {
        let mut seen = self.seen_nonces.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, seen_at| now.duration_since(*seen_at) < NONCE_TTL);
        seen.insert(nonce.to_string(), now);
    }

    /// Returns true the first time a nonce is observed; false on replay.
    pub fn verify_nonce(&self, nonce: &str) -> bool {
        let mut seen = self.seen_nonces.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, seen_at| now.duration_since(*seen_at) < NONCE_TTL);
        if seen.contains_key(nonce) {
            false
        } else {
            seen.insert(nonce.to_string(), now);
            true
        }
    }
}
