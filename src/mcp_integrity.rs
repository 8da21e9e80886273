//! Integrity verification for responses from MCP (Model Context Protocol) servers.
//!
//! Four checks run independently on every response: the source is registered and trusted,
//! the HMAC-SHA256 signature matches (when the source has a shared secret), the timestamp
//! is fresh, and the nonce has not been seen inside the replay window.

use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::McpSettings;
use crate::error::IntegrityError;
use crate::lock_utils::{lock_or_recover, read_lock_or_recover, write_lock_or_recover};
use crate::time_utils::now_millis;
use crate::timing_safe::timing_safe_equal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerType {
    Stdio,
    Http,
    Websocket,
}

/// A registered message source
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    pub trusted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip)]
    shared_secret: Option<Zeroizing<String>>,
    pub registered_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<u64>,
}

impl McpServer {
    /// A trusted source with no shared secret
    pub fn new(name: impl Into<String>, server_type: McpServerType) -> Self {
        Self {
            name: name.into(),
            server_type,
            trusted: true,
            public_key: None,
            shared_secret: None,
            registered_at: now_millis(),
            last_verified: None,
        }
    }

    pub fn trusted(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(Zeroizing::new(secret.into()));
        self
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    pub fn has_shared_secret(&self) -> bool {
        self.shared_secret.is_some()
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("name", &self.name)
            .field("server_type", &self.server_type)
            .field("trusted", &self.trusted)
            .field("public_key", &self.public_key)
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("registered_at", &self.registered_at)
            .field("last_verified", &self.last_verified)
            .finish()
    }
}

/// A response as received from an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResponse {
    pub server: String,
    pub method: String,
    pub data: Value,
    /// Milliseconds since epoch
    pub timestamp: u64,
    /// Lowercase hex HMAC-SHA256
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityChecks {
    pub server_trusted: bool,
    pub signature_present: bool,
    pub signature_valid: bool,
    pub timestamp_valid: bool,
    pub nonce_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub checks: IntegrityChecks,
    pub errors: Vec<String>,
}

/// The signed fields, in signing order. `nonce` is left out entirely when absent.
#[derive(Serialize)]
struct CanonicalMessage<'a> {
    server: &'a str,
    method: &'a str,
    data: Value,
    timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
}

/// Rebuild `value` with every object's keys in sorted order
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let sorted: Map<String, Value> =
                entries.into_iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Canonical JSON bytes that the signature covers
pub fn canonical_message(response: &McpResponse) -> Vec<u8> {
    let message = CanonicalMessage {
        server: &response.server,
        method: &response.method,
        data: sort_keys(&response.data),
        timestamp: response.timestamp,
        nonce: response.nonce.as_deref(),
    };
    // Serializing a struct of strings, integers and a Value cannot fail.
    serde_json::to_vec(&message).unwrap_or_default()
}

/// Hex-encoded HMAC-SHA256 of the canonical message
pub fn compute_signature(secret: &[u8], response: &McpResponse) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &canonical_message(response));
    hex::encode(tag.as_ref())
}

pub struct McpIntegrityVerifier {
    servers: RwLock<HashMap<String, McpServer>>,
    /// (server, nonce) -> expiry (ms since epoch)
    seen_nonces: Mutex<HashMap<(String, String), u64>>,
    freshness_window_ms: u64,
    replay_window_ms: u64,
    require_signatures: bool,
}

impl Default for McpIntegrityVerifier {
    fn default() -> Self {
        Self::new(&McpSettings::default())
    }
}

impl McpIntegrityVerifier {
    /// Empty registry with the windows and signing policy from `settings`
    pub fn new(settings: &McpSettings) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            seen_nonces: Mutex::new(HashMap::new()),
            freshness_window_ms: settings.freshness_window_secs.saturating_mul(1000),
            replay_window_ms: settings.replay_window_secs.saturating_mul(1000),
            require_signatures: settings.require_signatures,
        }
    }

    /// Registry seeded from `settings.servers`, resolving shared secrets from the environment
    pub fn from_config(settings: &McpSettings) -> Result<Self, IntegrityError> {
        Self::from_config_with(settings, |var| std::env::var(var).ok())
    }

    pub fn from_config_with<F>(settings: &McpSettings, lookup: F) -> Result<Self, IntegrityError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let verifier = Self::new(settings);

        for entry in &settings.servers {
            let mut server = McpServer::new(entry.name.clone(), entry.server_type).trusted(entry.trusted);

            if let Some(var) = &entry.shared_secret_env {
                let secret = lookup(var).filter(|s| !s.is_empty()).ok_or_else(|| {
                    IntegrityError::MissingSharedSecret {
                        server: entry.name.clone(),
                        var: var.clone(),
                    }
                })?;
                server = server.with_shared_secret(secret);
            }
            if let Some(public_key) = &entry.public_key {
                server = server.with_public_key(public_key.clone());
            }

            verifier.register_server(server);
        }

        Ok(verifier)
    }

    /// Add or replace a source
    pub fn register_server(&self, server: McpServer) {
        info!(
            "Registering MCP server '{}' ({:?}, trusted: {}, signed: {})",
            server.name,
            server.server_type,
            server.trusted,
            server.has_shared_secret()
        );

        let mut servers = write_lock_or_recover(&self.servers, "mcp registry");
        if servers.insert(server.name.clone(), server).is_some() {
            warn!("Replaced existing MCP server registration");
        }
    }

    pub fn server(&self, name: &str) -> Option<McpServer> {
        read_lock_or_recover(&self.servers, "mcp registry").get(name).cloned()
    }

    /// All registered sources, ordered by name
    pub fn list_servers(&self) -> Vec<McpServer> {
        let mut servers: Vec<McpServer> = read_lock_or_recover(&self.servers, "mcp registry")
            .values()
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    /// The signature a source with a shared secret would attach, if it has one
    pub fn sign_response(&self, response: &McpResponse) -> Option<String> {
        let servers = read_lock_or_recover(&self.servers, "mcp registry");
        let secret = servers.get(&response.server)?.shared_secret.as_ref()?;
        Some(compute_signature(secret.as_bytes(), response))
    }

    pub fn verify(&self, response: &McpResponse) -> IntegrityReport {
        self.verify_at(response, now_millis())
    }

    pub fn verify_at(&self, response: &McpResponse, now_ms: u64) -> IntegrityReport {
        let mut errors = Vec::new();
        let server = self.server(&response.server);

        let server_trusted = match &server {
            Some(s) if s.trusted => true,
            Some(_) => {
                errors.push(format!("MCP server '{}' is not trusted", response.server));
                false
            }
            None => {
                errors.push(format!("Unknown MCP server '{}'", response.server));
                false
            }
        };

        let signature_present = response.signature.is_some();
        let secret = server.as_ref().and_then(|s| s.shared_secret.as_ref());

        let signature_valid = match (secret, &response.signature) {
            (Some(secret), Some(signature)) => {
                let expected = compute_signature(secret.as_bytes(), response);
                let ok = timing_safe_equal(&expected, signature);
                if !ok {
                    errors.push("Invalid signature".to_string());
                }
                ok
            }
            (Some(_), None) => {
                errors.push("Missing signature from a server with a shared secret".to_string());
                false
            }
            (None, _) if self.require_signatures => {
                errors.push("Signatures are required but the server has no shared secret".to_string());
                false
            }
            (None, _) => true,
        };

        let skew = now_ms.abs_diff(response.timestamp);
        let timestamp_valid = skew <= self.freshness_window_ms;
        if !timestamp_valid {
            errors.push(format!("Response timestamp outside freshness window ({}ms skew)", skew));
        }

        let nonce_valid = match &response.nonce {
            Some(nonce) => {
                let authentic = server_trusted && signature_valid;
                let fresh = self.check_nonce(&response.server, nonce, now_ms, authentic);
                if !fresh {
                    errors.push("Nonce already used - possible replay attack".to_string());
                }
                fresh
            }
            None => true,
        };

        let valid = errors.is_empty() && server_trusted;

        if valid {
            let mut servers = write_lock_or_recover(&self.servers, "mcp registry");
            if let Some(s) = servers.get_mut(&response.server) {
                s.last_verified = Some(now_ms);
            }
            debug!("Verified {} response from '{}'", response.method, response.server);
        } else {
            warn!(
                "Rejected {} response from '{}': {}",
                response.method,
                response.server,
                errors.join("; ")
            );
        }

        IntegrityReport {
            valid,
            checks: IntegrityChecks {
                server_trusted,
                signature_present,
                signature_valid,
                timestamp_valid,
                nonce_valid,
            },
            errors,
        }
    }

    /// The response data, only if every check passed
    pub fn verify_and_unwrap(&self, response: &McpResponse) -> Result<Value, IntegrityError> {
        let report = self.verify(response);
        if report.valid {
            Ok(response.data.clone())
        } else {
            Err(IntegrityError::Rejected {
                server: response.server.clone(),
                errors: report.errors,
            })
        }
    }

    /// Number of nonces still inside the replay window
    pub fn replay_cache_len(&self) -> usize {
        lock_or_recover(&self.seen_nonces, "mcp nonces").len()
    }

    /// Whether `nonce` is unseen for `server` inside the window. It is remembered only
    /// when `remember` is set (trusted source, valid signature).
    fn check_nonce(&self, server: &str, nonce: &str, now_ms: u64, remember: bool) -> bool {
        let mut seen = lock_or_recover(&self.seen_nonces, "mcp nonces");
        seen.retain(|_, expires_at| *expires_at > now_ms);

        let key = (server.to_string(), nonce.to_string());
        if seen.contains_key(&key) {
            return false;
        }
        if remember {
            seen.insert(key, now_ms.saturating_add(self.replay_window_ms));
        }
        true
    }
}
