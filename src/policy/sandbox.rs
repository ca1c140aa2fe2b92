//! Filesystem path sandbox (C3).
//!
//! Extracts candidate paths from a `params` tree (any key matching
//! `path|dir|root`, case-insensitive) and checks them against configured
//! allow/forbid root lists.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::Value;

fn path_key_re() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)path|dir|root").unwrap())
}

/// Walks `params`, collecting every string value reachable through a key
/// whose name matches the path-ish pattern, flattening through arrays and
/// nested objects.
pub fn extract_candidate_paths(params: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk(params, false, &mut out);
    out
}

fn walk(value: &Value, under_path_key: bool, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let is_path_key = path_key_re().is_match(key);
                walk(val, is_path_key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, under_path_key, out);
            }
        }
        Value::String(s) if under_path_key => out.push(s.clone()),
        _ => {}
    }
}

fn normalize(path: &str) -> PathBuf {
    let p = Path::new(path);
    std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf())
}

fn fold_case(path: &Path) -> String {
    let s = path.to_string_lossy();
    if cfg!(any(target_os = "windows", target_os = "macos")) {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

fn is_under(path: &Path, root: &Path) -> bool {
    let path = fold_case(&normalize(&path.to_string_lossy()));
    let root = fold_case(&normalize(&root.to_string_lossy()));
    path.starts_with(&root)
}

pub struct Sandbox {
    allowed: Vec<PathBuf>,
    forbidden: Vec<PathBuf>,
}

impl Sandbox {
    pub fn new(allowed: Vec<PathBuf>, forbidden: Vec<PathBuf>) -> Self {
        Sandbox { allowed, forbidden }
    }

    pub fn is_path_allowed(&self, candidate: &str) -> bool {
        let path = Path::new(candidate);
        if self.forbidden.iter().any(|root| is_under(path, root)) {
            return false;
        }
        if self.allowed.is_empty() {
            return true;
        }
        self.allowed.iter().any(|root| is_under(path, root))
    }

    /// Returns the first path in `params` that is not allowed, if any.
    pub fn check_params(&self, params: &Value) -> Option<String> {
        extract_candidate_paths(params)
            .into_iter()
            .find(|p| !self.is_path_allowed(p))
    }
}
