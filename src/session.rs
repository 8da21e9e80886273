//! Encrypted, store-backed sessions with CSRF tokens and optional request binding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::error::SessionError;
use crate::kv_store::KeyValueStore;
use crate::session_crypto::{EncryptedData, SessionCipher};
use crate::time_utils::now_millis;
use crate::timing_safe::timing_safe_equal;

/// Store key namespace for session records
pub const SESSION_PREFIX: &str = "session:";

const SESSION_TOKEN_BYTES: usize = 32;
const CSRF_TOKEN_BYTES: usize = 24;

/// Floor on the store TTL when an update keeps the existing expiry
const MIN_REMAINING_TTL_SECS: u64 = 60;

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

static VERSION_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:\.\d+)*").expect("version pattern is valid"));

pub fn session_key(token: &str) -> String {
    format!("{}{}", SESSION_PREFIX, token)
}

/// User-Agent with version numbers masked, so browser patch updates don't break binding
pub fn normalize_user_agent(user_agent: &str) -> String {
    VERSION_NUMBER.replace_all(user_agent.trim(), "x").into_owned()
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Caller-supplied session contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decrypted session record. Timestamps are milliseconds since epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    pub last_activity: u64,
    pub csrf_token: String,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionData {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }
}

/// Which request attributes a new session is tied to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionBinding {
    pub bind_ip: bool,
    pub bind_user_agent: bool,
}

impl From<&SessionSettings> for SessionBinding {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            bind_ip: settings.bind_ip,
            bind_user_agent: settings.bind_user_agent,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Defaults to the manager's configured expiry
    pub expiry_seconds: Option<u64>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub binding: Option<SessionBinding>,
}

/// Request attributes checked against a bound session
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    /// Reject on mismatch; when false mismatches are only logged
    pub strict_binding: bool,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            client_ip: None,
            user_agent: None,
            strict_binding: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_token: String,
    pub csrf_token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cleaned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub expired_sessions: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RevocationReport {
    pub revoked: usize,
}

/// State of one stored record as seen by the maintenance scans
enum StoredSession {
    Active(SessionData),
    Expired(SessionData),
    Unreadable,
    Missing,
}

pub struct SessionManager {
    store: Arc<dyn KeyValueStore>,
    cipher: SessionCipher,
    default_expiry_secs: u64,
}

impl SessionManager {
    pub fn new(store: Arc<dyn KeyValueStore>, cipher: SessionCipher, default_expiry_secs: u64) -> Self {
        Self {
            store,
            cipher,
            default_expiry_secs,
        }
    }

    /// Build from settings, reading the encryption secret from the configured variable.
    ///
    /// A missing secret is an error here so the process refuses to start without one.
    pub fn from_settings(
        store: Arc<dyn KeyValueStore>,
        settings: &SessionSettings,
    ) -> Result<Self, SessionError> {
        let cipher = SessionCipher::from_env(&settings.encryption_key_env)?;
        Ok(Self::new(store, cipher, settings.default_expiry_secs))
    }

    pub fn default_expiry_secs(&self) -> u64 {
        self.default_expiry_secs
    }

    pub async fn create_session(
        &self,
        payload: SessionPayload,
        options: SessionOptions,
    ) -> Result<CreatedSession, SessionError> {
        let session_token = random_token(SESSION_TOKEN_BYTES);
        let csrf_token = random_token(CSRF_TOKEN_BYTES);
        let expiry_secs = options.expiry_seconds.unwrap_or(self.default_expiry_secs);
        let binding = options.binding.unwrap_or_default();
        let now = now_millis();

        let data = SessionData {
            user_id: payload.user_id,
            email: payload.email,
            permissions: payload.permissions,
            last_activity: now,
            csrf_token: csrf_token.clone(),
            created_at: now,
            expires_at: now.saturating_add(expiry_secs.saturating_mul(1000)),
            client_ip: options.client_ip.filter(|_| binding.bind_ip),
            user_agent: options.user_agent.filter(|_| binding.bind_user_agent),
            extra: payload.extra,
        };

        self.write(&session_token, &data, expiry_secs).await?;

        debug!(
            "Created session for user {:?} (expires in {}s, ip bound: {}, ua bound: {})",
            data.user_id,
            expiry_secs,
            data.client_ip.is_some(),
            data.user_agent.is_some()
        );

        Ok(CreatedSession {
            session_token,
            csrf_token,
        })
    }

    /// Load a live session. Misses, store errors and undecryptable records all read as `None`.
    pub async fn get_session(&self, token: &str) -> Option<SessionData> {
        let key = session_key(token);
        match self.load(&key).await {
            Ok(StoredSession::Active(data)) => Some(data),
            Ok(StoredSession::Expired(_)) => {
                debug!("Session expired, removing");
                if let Err(e) = self.store.delete(&key).await {
                    warn!("Failed to delete expired session: {}", e);
                }
                None
            }
            Ok(StoredSession::Unreadable) | Ok(StoredSession::Missing) => None,
            Err(e) => {
                warn!("Session lookup failed: {}", e);
                None
            }
        }
    }

    /// Load a session and check it against the request's binding attributes
    pub async fn validate_session(
        &self,
        token: &str,
        context: &ValidationContext,
    ) -> Option<SessionData> {
        let session = self.get_session(token).await?;

        if let (Some(bound_ip), Some(request_ip)) = (&session.client_ip, &context.client_ip) {
            if bound_ip != request_ip {
                warn!(
                    "Session IP mismatch for user {:?}: bound {}, request {}",
                    session.user_id, bound_ip, request_ip
                );
                if context.strict_binding {
                    return None;
                }
            }
        }

        if let (Some(bound_ua), Some(request_ua)) = (&session.user_agent, &context.user_agent) {
            if normalize_user_agent(bound_ua) != normalize_user_agent(request_ua) {
                warn!("Session User-Agent mismatch for user {:?}", session.user_id);
                if context.strict_binding {
                    return None;
                }
            }
        }

        Some(session)
    }

    /// Merge `updates` into the session and rewrite it.
    ///
    /// Returns false when the session is absent or the write fails. Concurrent updates
    /// to the same session are last-writer-wins.
    pub async fn update_session(
        &self,
        token: &str,
        updates: Map<String, Value>,
        extend_expiry: bool,
    ) -> bool {
        let Some(session) = self.get_session(token).await else {
            return false;
        };

        let now = now_millis();
        let old_expires_at = session.expires_at;

        let mut merged = match serde_json::to_value(&session) {
            Ok(Value::Object(map)) => map,
            _ => return false,
        };
        merged.extend(updates);
        merged.insert("lastActivity".to_string(), Value::from(now));

        let ttl_secs = if extend_expiry {
            merged.insert(
                "expiresAt".to_string(),
                Value::from(now.saturating_add(self.default_expiry_secs.saturating_mul(1000))),
            );
            self.default_expiry_secs
        } else {
            (old_expires_at.saturating_sub(now) / 1000).max(MIN_REMAINING_TTL_SECS)
        };

        let updated: SessionData = match serde_json::from_value(Value::Object(merged)) {
            Ok(data) => data,
            Err(e) => {
                warn!("Rejected session update with invalid fields: {}", e);
                return false;
            }
        };

        match self.write(token, &updated, ttl_secs).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write updated session: {}", e);
                false
            }
        }
    }

    /// Remove a session. True only when a record was actually deleted.
    pub async fn destroy_session(&self, token: &str) -> bool {
        match self.store.delete(&session_key(token)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to destroy session: {}", e);
                false
            }
        }
    }

    /// Compare a submitted CSRF token against the session's, in constant time
    pub async fn validate_csrf(&self, token: &str, csrf_token: &str) -> bool {
        match self.get_session(token).await {
            Some(session) => timing_safe_equal(&session.csrf_token, csrf_token),
            None => false,
        }
    }

    /// Delete every expired or undecryptable record
    pub async fn cleanup_expired_sessions(&self) -> Result<CleanupReport, SessionError> {
        let mut report = CleanupReport::default();

        for key in self.session_keys().await? {
            match self.load(&key).await {
                Ok(StoredSession::Expired(_)) | Ok(StoredSession::Unreadable) => {
                    match self.store.delete(&key).await {
                        Ok(true) => report.cleaned += 1,
                        Ok(false) => {}
                        Err(e) => warn!("Failed to delete {} during cleanup: {}", key, e),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping {} during cleanup: {}", key, e),
            }
        }

        if report.cleaned > 0 {
            info!("Session cleanup removed {} records", report.cleaned);
        }
        Ok(report)
    }

    pub async fn session_stats(&self) -> Result<SessionStats, SessionError> {
        let keys = self.session_keys().await?;
        let mut stats = SessionStats {
            total_sessions: keys.len(),
            ..Default::default()
        };

        for key in keys {
            match self.load(&key).await {
                Ok(StoredSession::Active(_)) => stats.active_sessions += 1,
                Ok(StoredSession::Expired(_)) | Ok(StoredSession::Unreadable) => {
                    stats.expired_sessions += 1
                }
                Ok(StoredSession::Missing) => {}
                Err(e) => warn!("Skipping {} in session stats: {}", key, e),
            }
        }

        Ok(stats)
    }

    /// Delete every readable session belonging to `user_id`
    pub async fn revoke_user_sessions(&self, user_id: &str) -> Result<RevocationReport, SessionError> {
        let mut report = RevocationReport::default();

        for key in self.session_keys().await? {
            let owner = match self.load(&key).await {
                Ok(StoredSession::Active(data)) | Ok(StoredSession::Expired(data)) => data.user_id,
                Ok(_) => None,
                Err(e) => {
                    warn!("Skipping {} during revocation: {}", key, e);
                    None
                }
            };

            if owner.as_deref() == Some(user_id) {
                match self.store.delete(&key).await {
                    Ok(true) => report.revoked += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to revoke {}: {}", key, e),
                }
            }
        }

        info!("Revoked {} sessions for user {}", report.revoked, user_id);
        Ok(report)
    }

    /// Run `cleanup_expired_sessions` every `interval` (at least one second) until the
    /// handle is aborted
    pub fn spawn_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let interval = interval.max(MIN_CLEANUP_INTERVAL);
        info!("Starting session cleanup task (interval: {:?})", interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = self.cleanup_expired_sessions().await {
                    warn!("Session cleanup failed: {}", e);
                }
            }
        })
    }

    async fn session_keys(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.store.scan_keys(&format!("{}*", SESSION_PREFIX)).await?)
    }

    async fn write(&self, token: &str, data: &SessionData, ttl_secs: u64) -> Result<(), SessionError> {
        let plaintext =
            serde_json::to_string(data).map_err(|e| SessionError::Serialization(e.to_string()))?;
        let sealed = self.cipher.encrypt(&plaintext)?;
        let record =
            serde_json::to_string(&sealed).map_err(|e| SessionError::Serialization(e.to_string()))?;

        self.store.set_ex(&session_key(token), &record, ttl_secs).await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<StoredSession, SessionError> {
        let Some(record) = self.store.get(key).await? else {
            return Ok(StoredSession::Missing);
        };

        Ok(match self.open(&record) {
            Some(data) if data.is_expired_at(now_millis()) => StoredSession::Expired(data),
            Some(data) => StoredSession::Active(data),
            None => StoredSession::Unreadable,
        })
    }

    fn open(&self, record: &str) -> Option<SessionData> {
        let sealed: EncryptedData = match serde_json::from_str(record) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Session record is not an encrypted envelope: {}", e);
                return None;
            }
        };

        let plaintext = match self.cipher.decrypt(&sealed) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Session decryption failed: {}", e);
                return None;
            }
        };

        match serde_json::from_str(&plaintext) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Decrypted session is not valid session data: {}", e);
                None
            }
        }
    }
}
