pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl LimiterConfig {
    /// Load configuration from a file, falling back to built-in defaults
    /// when the file does not exist, then apply environment overrides and
    /// validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: LimiterConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            LimiterConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(backend = %config.backend, algorithm = %config.algorithm, "loaded rate limiter configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RATEWALL_BACKEND") {
            self.backend = v;
        }
        if let Ok(v) = std::env::var("RATEWALL_DEFAULT_RATE") {
            self.default_rate = v;
        }
        if let Ok(v) = std::env::var("RATEWALL_ALGORITHM") {
            self.algorithm = v;
        }
        if let Ok(v) = std::env::var("RATEWALL_FAIL_OPEN") {
            self.fail_open = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("RATEWALL_KEY_PREFIX") {
            self.key_prefix = v;
        }
        if let Ok(v) = std::env::var("RATEWALL_REMOTE_URL") {
            self.remote.url = v;
        }
        if let Ok(v) = std::env::var("RATEWALL_REMOTE_POOL_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                self.remote.pool_size = n;
            }
        }
        if let Ok(v) = std::env::var("RATEWALL_REMOTE_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.remote.timeout_ms = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        crate::rate_spec::parse_rate_spec(&self.default_rate)
            .map_err(|e| anyhow::anyhow!("invalid default_rate {:?}: {e}", self.default_rate))?;

        match self.algorithm.as_str() {
            "fixed" | "sliding" | "token_bucket" => {}
            other => anyhow::bail!("unknown algorithm: {other:?}"),
        }

        match self.backend.as_str() {
            "memory" => {}
            "remote" => {
                if self.remote.url.is_empty() {
                    anyhow::bail!("remote.url must not be empty when backend = \"remote\"");
                }
            }
            "multi" => {
                if self.backends.is_empty() {
                    anyhow::bail!("backends must not be empty when backend = \"multi\"");
                }
                for child in &self.backends {
                    if child.name.is_empty() {
                        anyhow::bail!("every multi backend child needs a name");
                    }
                    match child.kind.as_str() {
                        "memory" | "remote" => {}
                        other => anyhow::bail!("unknown backend kind for child {:?}: {other:?}", child.name),
                    }
                }
            }
            other => anyhow::bail!("unknown backend: {other:?}, use memory, remote, or multi"),
        }

        match self.multi_strategy.as_str() {
            "first_healthy" | "round_robin" => {}
            other => anyhow::bail!("unknown multi_strategy: {other:?}"),
        }

        if self.algorithm == "token_bucket" && self.refill_rate.is_none() {
            anyhow::bail!("refill_rate must be set when algorithm = \"token_bucket\"");
        }

        Ok(())
    }
}
