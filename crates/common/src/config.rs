use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::descriptor::ToolDescriptor;
use crate::error::{InvokeError, InvokeResult};

/// What to do when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Refuse with `overloaded`; callers retry with their own backoff.
    #[default]
    Reject,
    /// Block the submitter until space frees or the deadline passes.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_bytes_budget")]
    pub bytes_budget: u64,
    #[serde(default = "default_entry_ttl_ms")]
    pub entry_ttl_ms: u64,
    /// Caching of failed outcomes; off by default.
    #[serde(default)]
    pub negative: bool,
    #[serde(default = "default_negative_ttl_ms")]
    pub negative_ttl_ms: u64,
    /// When set, outcomes persist under `<dir>/<fp[:2]>/<fp>.bin`
    /// with a `.meta` JSON sidecar.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            bytes_budget: default_cache_bytes_budget(),
            entry_ttl_ms: default_entry_ttl_ms(),
            negative: false,
            negative_ttl_ms: default_negative_ttl_ms(),
            dir: None,
        }
    }
}

/// Full core configuration, loaded from TOML with `ARSENAL_*`
/// environment overrides applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_max_global_concurrency")]
    pub max_global_concurrency: usize,
    /// Per-parallelism-class caps, e.g. `network-heavy = 16`.
    /// Classes without a cap share only the global budget.
    #[serde(default)]
    pub class_caps: HashMap<String, usize>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub admission_policy: AdmissionPolicy,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_capture_limit_bytes")]
    pub capture_limit_bytes: usize,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Confinement root for path-kind arguments and tool working dirs.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tools: HashMap<String, ToolDescriptor>,
}

fn default_max_global_concurrency() -> usize {
    32
}

fn default_queue_capacity() -> usize {
    256
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_capture_limit_bytes() -> usize {
    1024 * 1024
}

fn default_grace_period_ms() -> u64 {
    2_000
}

fn default_cache_bytes_budget() -> u64 {
    64 * 1024 * 1024
}

fn default_entry_ttl_ms() -> u64 {
    15 * 60 * 1_000
}

fn default_negative_ttl_ms() -> u64 {
    60_000
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_global_concurrency: default_max_global_concurrency(),
            class_caps: HashMap::new(),
            queue_capacity: default_queue_capacity(),
            admission_policy: AdmissionPolicy::default(),
            default_timeout_ms: default_timeout_ms(),
            capture_limit_bytes: default_capture_limit_bytes(),
            grace_period_ms: default_grace_period_ms(),
            workspace_root: None,
            cache: CacheConfig::default(),
            tools: HashMap::new(),
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> InvokeResult<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            InvokeError::BadRequest(format!("cannot read config {}: {}", path.display(), err))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> InvokeResult<Self> {
        let mut config: CoreConfig = toml::from_str(contents)
            .map_err(|err| InvokeError::BadRequest(format!("invalid config: {}", err)))?;
        // [tools.<name>] tables carry the name as the table key.
        for (name, descriptor) in config.tools.iter_mut() {
            descriptor.name = name.clone();
        }
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Take descriptors out for registry construction.
    pub fn take_tools(&mut self) -> Vec<ToolDescriptor> {
        self.tools.drain().map(|(_, descriptor)| descriptor).collect()
    }

    fn validate(&self) -> InvokeResult<()> {
        if self.max_global_concurrency == 0 {
            return Err(InvokeError::BadRequest(
                "max_global_concurrency must be greater than zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(InvokeError::BadRequest(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        if self.default_timeout_ms == 0 {
            return Err(InvokeError::BadRequest(
                "default_timeout_ms must be greater than zero".into(),
            ));
        }
        for (class, cap) in &self.class_caps {
            if *cap == 0 {
                return Err(InvokeError::BadRequest(format!(
                    "class cap for '{}' must be greater than zero",
                    class
                )));
            }
        }
        for descriptor in self.tools.values() {
            descriptor.validate()?;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env_usize("ARSENAL_MAX_GLOBAL_CONCURRENCY") {
            self.max_global_concurrency = v;
        }
        if let Some(v) = parse_env_usize("ARSENAL_QUEUE_CAPACITY") {
            self.queue_capacity = v;
        }
        if let Some(v) = parse_env_u64("ARSENAL_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = v;
        }
        if let Some(v) = parse_env_usize("ARSENAL_CAPTURE_LIMIT_BYTES") {
            self.capture_limit_bytes = v;
        }
        if let Some(v) = parse_env_u64("ARSENAL_GRACE_PERIOD_MS") {
            self.grace_period_ms = v;
        }
        if let Some(v) = parse_env_u64("ARSENAL_CACHE_BYTES_BUDGET") {
            self.cache.bytes_budget = v;
        }
        if let Some(v) = parse_env_u64("ARSENAL_CACHE_ENTRY_TTL_MS") {
            self.cache.entry_ttl_ms = v;
        }
        if let Some(v) = parse_env_u64("ARSENAL_CACHE_NEGATIVE_TTL_MS") {
            self.cache.negative_ttl_ms = v;
        }
        if let Ok(raw) = std::env::var("ARSENAL_ADMISSION_POLICY") {
            match raw.to_lowercase().as_str() {
                "reject" => self.admission_policy = AdmissionPolicy::Reject,
                "block" => self.admission_policy = AdmissionPolicy::Block,
                other => {
                    tracing::warn!("ignoring unknown ARSENAL_ADMISSION_POLICY '{}'", other);
                }
            }
        }
    }
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse::<u64>().ok()
}

fn parse_env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse::<usize>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
max_global_concurrency = 8
queue_capacity = 16
admission_policy = "block"
default_timeout_ms = 30000
capture_limit_bytes = 65536
grace_period_ms = 1500

[class_caps]
network-heavy = 4
browser = 1

[cache]
bytes_budget = 1048576
entry_ttl_ms = 60000
negative = true

[tools.echo]
program = "/bin/echo"
class = "cpu-heavy"

[[tools.echo.arg]]
name = "msg"
kind = "string"
required = true
"#;

    #[test]
    fn parse_full_config() {
        let config = CoreConfig::parse(SAMPLE).expect("parse");
        assert_eq!(config.max_global_concurrency, 8);
        assert_eq!(config.admission_policy, AdmissionPolicy::Block);
        assert_eq!(config.class_caps.get("network-heavy"), Some(&4));
        assert!(config.cache.negative);
        let echo = config.tools.get("echo").expect("echo tool");
        assert_eq!(echo.name, "echo");
        assert_eq!(echo.args.len(), 1);
        assert_eq!(echo.class, "cpu-heavy");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = CoreConfig::parse("").expect("parse empty");
        assert_eq!(config.max_global_concurrency, 32);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.admission_policy, AdmissionPolicy::Reject);
        assert_eq!(config.cache.bytes_budget, 64 * 1024 * 1024);
        assert!(!config.cache.negative);
        assert!(config.tools.is_empty());
    }

    #[test]
    fn zero_caps_are_rejected() {
        assert!(CoreConfig::parse("max_global_concurrency = 0").is_err());
        assert!(CoreConfig::parse("queue_capacity = 0").is_err());
        assert!(CoreConfig::parse("[class_caps]\nbrowser = 0").is_err());
    }

    #[test]
    fn bad_tool_schema_is_rejected() {
        let bad = r#"
[tools.scan]
program = ""
"#;
        assert!(CoreConfig::parse(bad).is_err());
    }
}
