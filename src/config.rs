use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::mcp_integrity::McpServerType;

/// Environment variable that overrides `store.url`
pub const STORE_URL_ENV: &str = "REDIS_URL";

/// Guard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub rate_limit: RateLimitSettings,
    pub reputation: ReputationListConfig,
    pub session: SessionSettings,
    pub mcp: McpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Requests per window for `/api/*` routes
    pub api_limit: u64,
    /// Window for `/api/*` routes in seconds
    pub api_window_secs: u64,
    /// Requests per window for session creation (fails closed)
    pub session_create_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            api_limit: 60,
            api_window_secs: 60,
            session_create_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL; unset means in-memory only (local development)
    pub url: Option<String>,
    /// Upper bound on every store round-trip
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            command_timeout_ms: 2000,
        }
    }
}

/// Limits applied for one reputation class. A blocking tier refuses without counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    pub limit: u64,
    pub window_secs: u64,
    #[serde(default)]
    pub block: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationTiers {
    /// Applies to IPs on the block list
    pub malicious: TierConfig,
    /// Applies to IPs flagged by the oracle or escalated by local abuse
    pub suspicious: TierConfig,
}

impl Default for ReputationTiers {
    fn default() -> Self {
        Self {
            malicious: TierConfig {
                limit: 1,
                window_secs: 3600,
                block: true,
            },
            suspicious: TierConfig {
                limit: 10,
                window_secs: 300,
                block: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// How often expired in-memory windows and decayed reputation are swept
    pub sweep_interval_secs: u64,
    /// Maximum IPs held by the local reputation tracker
    pub reputation_capacity: usize,
    pub tiers: ReputationTiers,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            reputation_capacity: 10_000,
            tiers: ReputationTiers::default(),
        }
    }
}

/// Static block/suspicious lists (exact IPs or CIDR ranges)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationListConfig {
    pub suspicious: Vec<String>,
    /// Entry -> block reason
    pub blocked: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub default_expiry_secs: u64,
    /// Name of the environment variable holding the encryption secret
    pub encryption_key_env: String,
    pub cleanup_interval_secs: u64,
    pub bind_ip: bool,
    pub bind_user_agent: bool,
    pub strict_binding: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_expiry_secs: 86_400,
            encryption_key_env: "SESSION_ENCRYPTION_KEY".to_string(),
            cleanup_interval_secs: 3600,
            bind_ip: false,
            bind_user_agent: false,
            strict_binding: true,
        }
    }
}

/// A statically registered MCP source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    #[serde(default = "default_trusted")]
    pub trusted: bool,
    /// Environment variable holding the HMAC shared secret
    #[serde(default)]
    pub shared_secret_env: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

fn default_trusted() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    pub freshness_window_secs: u64,
    pub replay_window_secs: u64,
    /// Reject sources that do not sign responses
    pub require_signatures: bool,
    pub servers: Vec<McpServerConfig>,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            freshness_window_secs: 300,
            replay_window_secs: 300,
            require_signatures: false,
            servers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(STORE_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.store.url = Some(url);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: cannot be 0");
        }

        if self.server.api_limit == 0 || self.server.api_window_secs == 0 {
            anyhow::bail!("Invalid API rate limit: limit and window must be > 0");
        }

        if self.server.session_create_limit == 0 {
            anyhow::bail!("Invalid session_create_limit: must be > 0");
        }

        if self.store.command_timeout_ms == 0 {
            anyhow::bail!("Invalid store command_timeout_ms: must be > 0");
        }

        if self.rate_limit.sweep_interval_secs < 60 {
            anyhow::bail!(
                "Invalid rate_limit sweep_interval_secs: {} (minimum 60)",
                self.rate_limit.sweep_interval_secs
            );
        }

        if self.rate_limit.reputation_capacity == 0 {
            anyhow::bail!("Invalid rate_limit reputation_capacity: must be > 0");
        }

        let tiers = &self.rate_limit.tiers;
        for (name, tier) in [
            ("malicious", tiers.malicious),
            ("suspicious", tiers.suspicious),
        ] {
            if tier.limit == 0 || tier.window_secs == 0 {
                anyhow::bail!("Invalid {} tier: limit and window_secs must be > 0", name);
            }
        }

        if self.session.default_expiry_secs == 0 {
            anyhow::bail!("Invalid session default_expiry_secs: must be > 0");
        }

        if self.session.cleanup_interval_secs == 0 {
            anyhow::bail!("Invalid session cleanup_interval_secs: must be > 0");
        }

        if self.session.encryption_key_env.trim().is_empty() {
            anyhow::bail!("Invalid session encryption_key_env: must name a variable");
        }

        if self.mcp.freshness_window_secs == 0 || self.mcp.replay_window_secs == 0 {
            anyhow::bail!("Invalid MCP windows: must be > 0");
        }

        for server in &self.mcp.servers {
            if server.name.trim().is_empty() {
                anyhow::bail!("Invalid MCP server entry: name cannot be empty");
            }
        }

        Ok(())
    }
}
