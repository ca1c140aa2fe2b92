//! Policy & enforcement (C3): role→tool gating, size/array limits, path
//! sandbox, rate limiting and schema validation, all driven by a policy
//! document re-read lazily on every dispatch.

pub mod rate_limit;
pub mod sandbox;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyError;
use rate_limit::RateLimiter;
use sandbox::Sandbox;
use schema::SchemaRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePatterns {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_global_rate")]
    pub rate_per_minute_global: usize,
    #[serde(default = "default_tool_rate")]
    pub rate_per_minute_per_tool: usize,
    #[serde(default = "default_request_size_kb")]
    pub request_size_kb: u64,
    #[serde(default = "default_array_items_max")]
    pub array_items_max: usize,
}

fn default_global_rate() -> usize {
    120
}
fn default_tool_rate() -> usize {
    30
}
fn default_request_size_kb() -> u64 {
    256
}
fn default_array_items_max() -> usize {
    1000
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            rate_per_minute_global: default_global_rate(),
            rate_per_minute_per_tool: default_tool_rate(),
            request_size_kb: default_request_size_kb(),
            array_items_max: default_array_items_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Paths {
    #[serde(default)]
    pub allowed: Vec<PathBuf>,
    #[serde(default)]
    pub forbidden: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default)]
    pub hmac_secret_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyDocument {
    #[serde(default)]
    pub roles: std::collections::HashMap<String, RolePatterns>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl PolicyDocument {
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            return Ok(PolicyDocument::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| PolicyError::Load(e.to_string()))?;
        serde_yml::from_str(&raw).map_err(|e| PolicyError::Load(e.to_string()))
    }

    /// Patterns match tool names via shell globs. A `!`-prefixed allow
    /// entry is an explicit deny that short-circuits any positive match.
    pub fn is_tool_allowed(&self, role: &str, tool: &str) -> bool {
        let Some(patterns) = self.roles.get(role) else {
            return false;
        };

        let negated = patterns.allow.iter().filter(|p| p.starts_with('!'));
        for neg in negated {
            if Pattern::new(&neg[1..]).map(|p| p.matches(tool)).unwrap_or(false) {
                return false;
            }
        }
        for deny in &patterns.deny {
            if Pattern::new(deny).map(|p| p.matches(tool)).unwrap_or(false) {
                return false;
            }
        }

        let mut explicit_allow = false;
        for allow in patterns.allow.iter().filter(|p| !p.starts_with('!')) {
            if Pattern::new(allow).map(|p| p.matches(tool)).unwrap_or(false) {
                explicit_allow = true;
                break;
            }
        }
        explicit_allow
    }
}

struct Cached {
    doc: PolicyDocument,
    mtime: Option<SystemTime>,
    rate_limiter: RateLimiter,
}

/// Owns the policy document plus the stateful enforcement objects
/// (rate limiter) that must be rebuilt when relevant fields change.
pub struct PolicyEngine {
    path: PathBuf,
    cached: RwLock<Cached>,
    reload_lock: Mutex<()>,
    pub schema: SchemaRegistry,
    /// Additional sandbox roots supplied out-of-band (e.g. `MCP_ALLOWED_PATHS`),
    /// merged with the policy document's own `paths.allowed` on every `sandbox()` call.
    extra_allowed_paths: Vec<PathBuf>,
}

impl PolicyEngine {
    pub fn load(path: PathBuf) -> Result<Self, PolicyError> {
        let doc = PolicyDocument::load(&path)?;
        let rate_limiter = RateLimiter::new(
            doc.limits.rate_per_minute_global,
            doc.limits.rate_per_minute_per_tool,
        );
        let mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        Ok(PolicyEngine {
            path,
            cached: RwLock::new(Cached {
                doc,
                mtime,
                rate_limiter,
            }),
            reload_lock: Mutex::new(()),
            schema: SchemaRegistry::new(),
            extra_allowed_paths: Vec::new(),
        })
    }

    /// Adds sandbox roots beyond what the policy document declares (e.g. from
    /// `MCP_ALLOWED_PATHS`). Merged into every `sandbox()` call.
    pub fn with_extra_allowed_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.extra_allowed_paths = paths;
        self
    }

    /// Re-reads the policy document if its mtime advanced since the last
    /// load. Rebuilds the rate limiter only when its governing fields changed.
    pub fn refresh(&self) -> Result<(), PolicyError> {
        let _guard = self.reload_lock.lock().unwrap();
        let current_mtime = std::fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());

        let needs_reload = {
            let cached = self.cached.read().unwrap();
            current_mtime != cached.mtime
        };
        if !needs_reload {
            return Ok(());
        }

        let new_doc = PolicyDocument::load(&self.path)?;
        let mut cached = self.cached.write().unwrap();
        let limits_changed = new_doc.limits.rate_per_minute_global != cached.doc.limits.rate_per_minute_global
            || new_doc.limits.rate_per_minute_per_tool != cached.doc.limits.rate_per_minute_per_tool;
        if limits_changed {
            cached.rate_limiter = RateLimiter::new(
                new_doc.limits.rate_per_minute_global,
                new_doc.limits.rate_per_minute_per_tool,
            );
        }
        cached.doc = new_doc;
        cached.mtime = current_mtime;
        Ok(())
    }

    pub fn is_tool_allowed(&self, role: &str, tool: &str) -> bool {
        self.cached.read().unwrap().doc.is_tool_allowed(role, tool)
    }

    pub fn check_rate(&self, tool: &str) -> rate_limit::RateDecision {
        self.cached.read().unwrap().rate_limiter.check(tool)
    }

    pub fn check_size(&self, params: &Value) -> Result<(), PolicyError> {
        let cached = self.cached.read().unwrap();
        let serialized = serde_json::to_vec(params).unwrap_or_default();
        let actual_kb = (serialized.len() as u64).div_ceil(1024);
        if actual_kb > cached.doc.limits.request_size_kb {
            return Err(PolicyError::RequestTooLarge {
                actual_kb,
                limit_kb: cached.doc.limits.request_size_kb,
            });
        }
        let max_array = max_array_len(params);
        if max_array > cached.doc.limits.array_items_max {
            return Err(PolicyError::ArrayTooLarge {
                actual: max_array,
                limit: cached.doc.limits.array_items_max,
            });
        }
        Ok(())
    }

    pub fn sandbox(&self) -> Sandbox {
        let cached = self.cached.read().unwrap();
        let mut allowed = cached.doc.paths.allowed.clone();
        allowed.extend(self.extra_allowed_paths.iter().cloned());
        Sandbox::new(allowed, cached.doc.paths.forbidden.clone())
    }

    pub fn audit_secret_env(&self) -> Option<String> {
        self.cached.read().unwrap().doc.audit.hmac_secret_env.clone()
    }
}

fn max_array_len(value: &Value) -> usize {
    match value {
        Value::Array(items) => items
            .iter()
            .map(max_array_len)
            .max()
            .unwrap_or(0)
            .max(items.len()),
        Value::Object(map) => map.values().map(max_array_len).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_role() -> PolicyDocument {
        let mut roles = std::collections::HashMap::new();
        roles.insert(
            "dev".to_string(),
            RolePatterns {
                allow: vec!["asset.*".to_string(), "!asset.delete_*".to_string()],
                deny: vec![],
            },
        );
        PolicyDocument {
            roles,
            ..Default::default()
        }
    }

    #[test]
    fn negated_allow_pattern_takes_precedence() {
        let doc = doc_with_role();
        assert!(doc.is_tool_allowed("dev", "asset.batch_import"));
        assert!(!doc.is_tool_allowed("dev", "asset.delete_folder"));
    }

    #[test]
    fn unknown_role_is_denied() {
        let doc = doc_with_role();
        assert!(!doc.is_tool_allowed("guest", "asset.batch_import"));
    }

    #[test]
    fn no_positive_match_is_denied() {
        let doc = doc_with_role();
        assert!(!doc.is_tool_allowed("dev", "sequence.create"));
    }

    #[test]
    fn array_items_max_counts_deepest_array() {
        let items: Vec<i32> = (0..5).collect();
        let v = json!({"items": items});
        assert_eq!(max_array_len(&v), 5);
    }

    #[test]
    fn extra_allowed_paths_merge_into_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.yaml");
        std::fs::write(&policy_path, "roles: {dev: {allow: ['*']}}\n").unwrap();
        let engine = PolicyEngine::load(policy_path)
            .unwrap()
            .with_extra_allowed_paths(vec![dir.path().to_path_buf()]);
        let sandbox = engine.sandbox();
        assert!(sandbox.is_path_allowed(&dir.path().join("scene.uasset").to_string_lossy()));
        assert!(!sandbox.is_path_allowed("/definitely/not/allowed"));
    }
}
