//! Environment-driven configuration.
//!
//! Precedence is env var over built-in default; there is no remote config
//! service and no settings database. `optional_env`/`parse_optional_env`
//! are the only two primitives every field is built from.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("failed to read {key}: {e}"))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        None => Ok(default),
        Some(val) => val.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

fn parse_allowed_paths(raw: Option<String>) -> Vec<PathBuf> {
    raw.map(|s| s.split(';').filter(|p| !p.is_empty()).map(PathBuf::from).collect())
        .unwrap_or_default()
}

/// All settings the gateway needs to start; built once at process start from
/// the environment (plus `.env` if present) and then treated as immutable.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the caller-facing listener binds to.
    pub bind_addr: String,
    /// Address of the embedded editor plugin's TCP endpoint.
    pub upstream_addr: String,
    /// Sent as `engineVersion` during handshake.
    pub engine_version: String,
    /// Sent as `pluginVersion` during handshake.
    pub plugin_version: String,
    /// Path to the policy document (roles/limits/paths/audit).
    pub policy_path: PathBuf,
    /// Allow mutating tool calls to actually reach the editor.
    pub allow_write: bool,
    /// When true, mutating tools short-circuit as if executed, without dispatching.
    pub dry_run: bool,
    /// Filesystem roots the path sandbox should accept in addition to the policy file's list.
    pub allowed_paths: Vec<PathBuf>,
    /// Env var name holding the HMAC secret for audit signing (value looked up lazily).
    pub audit_secret_env: String,
    pub dedup_journal_path: PathBuf,
    pub dedup_ttl_secs: u64,
    pub dedup_max_entries: usize,
    pub audit_journal_path: PathBuf,
    pub recipe_parallelism: usize,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected \"pretty\" or \"json\", got \"{other}\"")),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(GatewayConfig {
            bind_addr: optional_env("MCP_BIND_ADDR")?
                .unwrap_or_else(|| "127.0.0.1:55556".to_string()),
            upstream_addr: optional_env("MCP_UPSTREAM_ADDR")?
                .unwrap_or_else(|| "127.0.0.1:55557".to_string()),
            engine_version: optional_env("MCP_ENGINE_VERSION")?
                .unwrap_or_else(|| "unknown".to_string()),
            plugin_version: optional_env("MCP_PLUGIN_VERSION")?
                .unwrap_or_else(|| "unknown".to_string()),
            policy_path: optional_env("MCP_POLICY_PATH")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("policy.yaml")),
            allow_write: parse_optional_env("MCP_ALLOW_WRITE", false)?,
            dry_run: parse_optional_env("MCP_DRY_RUN", true)?,
            allowed_paths: parse_allowed_paths(optional_env("MCP_ALLOWED_PATHS")?),
            audit_secret_env: optional_env("MCP_AUDIT_SECRET_ENV")?
                .unwrap_or_else(|| "MCP_AUDIT_SECRET".to_string()),
            dedup_journal_path: optional_env("MCP_DEDUP_JOURNAL")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs/dedup.jsonl")),
            dedup_ttl_secs: parse_optional_env("MCP_DEDUP_TTL_SECS", 600)?,
            dedup_max_entries: parse_optional_env("MCP_DEDUP_MAX_ENTRIES", 2048)?,
            audit_journal_path: optional_env("MCP_AUDIT_JOURNAL")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs/audit.jsonl")),
            recipe_parallelism: parse_optional_env("MCP_RECIPE_PARALLELISM", 1)?,
            log_format: parse_optional_env("MCP_LOG_FORMAT", LogFormat::Pretty)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "MCP_BIND_ADDR",
            "MCP_UPSTREAM_ADDR",
            "MCP_ENGINE_VERSION",
            "MCP_PLUGIN_VERSION",
            "MCP_POLICY_PATH",
            "MCP_ALLOW_WRITE",
            "MCP_DRY_RUN",
            "MCP_ALLOWED_PATHS",
            "MCP_AUDIT_SECRET_ENV",
            "MCP_DEDUP_JOURNAL",
            "MCP_DEDUP_TTL_SECS",
            "MCP_DEDUP_MAX_ENTRIES",
            "MCP_AUDIT_JOURNAL",
            "MCP_RECIPE_PARALLELISM",
            "MCP_LOG_FORMAT",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_are_safe_by_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let cfg = GatewayConfig::from_env().unwrap();
        assert!(!cfg.allow_write);
        assert!(cfg.dry_run);
        assert_eq!(cfg.upstream_addr, "127.0.0.1:55557");
        assert_eq!(cfg.dedup_ttl_secs, 600);
        assert_eq!(cfg.dedup_max_entries, 2048);
    }

    #[test]
    fn env_overrides_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var("MCP_ALLOW_WRITE", "true") };
        unsafe { std::env::set_var("MCP_ALLOWED_PATHS", "/a;/b") };
        let cfg = GatewayConfig::from_env().unwrap();
        assert!(cfg.allow_write);
        assert_eq!(cfg.allowed_paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        clear_all();
    }

    #[test]
    fn invalid_log_format_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var("MCP_LOG_FORMAT", "xml") };
        let err = GatewayConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        clear_all();
    }
}
