use serde::{Deserialize, Serialize};

fn default_backend_kind() -> String {
    "memory".to_string()
}

fn default_algorithm() -> String {
    "fixed".to_string()
}

fn default_rate() -> String {
    "100/m".to_string()
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "ratewall".to_string()
}

fn default_health_check_interval_secs() -> u64 {
    10
}

fn default_multi_strategy() -> String {
    "first_healthy".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_open_duration_secs() -> u64 {
    30
}

fn default_failure_window_secs() -> u64 {
    60
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

fn default_max_keys() -> usize {
    10_000
}

fn default_min_retain_secs() -> u64 {
    1
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    100
}

/// Top-level configuration for a `Limiter`, the config-file counterpart to
/// building `Policy`/`Backend` values directly in code. Every field carries
/// its own default function so a config file only needs to name the
/// settings it wants to override, the same per-field-default idiom the
/// rest of this ecosystem's configuration structs use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// "memory" | "remote" | "multi".
    #[serde(default = "default_backend_kind")]
    pub backend: String,
    /// Children used when `backend = "multi"`.
    #[serde(default)]
    pub backends: Vec<NamedBackendConfig>,
    #[serde(default = "default_multi_strategy")]
    pub multi_strategy: String,
    #[serde(default = "default_rate")]
    pub default_rate: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub bucket_size: Option<u64>,
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default = "default_true")]
    pub align_window_to_clock: bool,
    #[serde(default)]
    pub fail_open: bool,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            backend: default_backend_kind(),
            backends: Vec::new(),
            multi_strategy: default_multi_strategy(),
            default_rate: default_rate(),
            algorithm: default_algorithm(),
            bucket_size: None,
            refill_rate: None,
            align_window_to_clock: true,
            fail_open: false,
            health_check_interval_secs: default_health_check_interval_secs(),
            key_prefix: default_key_prefix(),
            circuit: CircuitConfig::default(),
            memory: MemoryConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

/// One named child of a `multi` backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedBackendConfig {
    pub name: String,
    /// "memory" | "remote".
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

impl Default for NamedBackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: default_backend_kind(),
            memory: MemoryConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_duration_secs")]
    pub open_duration_secs: u64,
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_secs: default_open_duration_secs(),
            failure_window_secs: default_failure_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
    #[serde(default = "default_min_retain_secs")]
    pub min_retain_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_keys: default_max_keys(),
            min_retain_secs: default_min_retain_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
        }
    }
}
