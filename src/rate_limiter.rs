use futures::join;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{RateLimitSettings, ReputationTiers, TierConfig};
use crate::error::StoreError;
use crate::ip_extraction::parse_ip_literal;
use crate::kv_store::{KeyValueStore, PTTL_NO_EXPIRY};
use crate::lock_utils::lock_or_recover;
use crate::reputation::{
    Classification, IpReputationEntry, LocalReputationTracker, NoReputationOracle,
    ReputationOracle,
};
use crate::time_utils::now_millis;

/// Store key namespace for fixed-window counters
pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";

/// Minimum interval between sweeps of the in-memory fallback
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Store key for an identifier
pub fn rate_limit_key(identifier: &str) -> String {
    format!("{}{}", RATE_LIMIT_PREFIX, identifier)
}

/// Per-call rate limit policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub limit: u64,
    /// Window duration in seconds
    pub window_in_seconds: u64,
    /// Deny when the store is unreachable instead of degrading to the local counter
    pub fail_closed: bool,
    /// Consult IP reputation (only applies when the identifier is an IP literal)
    pub check_reputation: bool,
}

impl RateLimitConfig {
    pub fn new(limit: u64, window_in_seconds: u64) -> Self {
        Self {
            limit,
            window_in_seconds,
            fail_closed: false,
            check_reputation: false,
        }
    }

    pub fn fail_closed(mut self) -> Self {
        self.fail_closed = true;
        self
    }

    pub fn with_reputation(mut self) -> Self {
        self.check_reputation = true;
        self
    }
}

/// Reputation details attached when reputation mode evaluated the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReputationInfo {
    pub is_blocked: bool,
    pub is_suspicious: bool,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of a single rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub success: bool,
    pub limit: u64,
    pub remaining: u64,
    /// When the current window ends (milliseconds since epoch)
    pub reset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<ReputationInfo>,
}

impl RateLimitResult {
    fn from_count(count: u64, limit: u64, reset: u64) -> Self {
        Self {
            success: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset,
            reputation: None,
        }
    }

    fn denied(limit: u64, reset: u64) -> Self {
        Self {
            success: false,
            limit,
            remaining: 0,
            reset,
            reputation: None,
        }
    }

    /// Seconds until the window resets, rounded up (for `Retry-After`)
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// Headers describing a rate limit result
pub fn rate_limit_headers(result: &RateLimitResult) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("X-RateLimit-Limit", result.limit.to_string()),
        ("X-RateLimit-Remaining", result.remaining.to_string()),
        ("X-RateLimit-Reset", result.reset.to_string()),
    ];

    if let Some(reputation) = &result.reputation {
        headers.push(("X-RateLimit-Reputation", reputation.classification.to_string()));
        headers.push(("X-RateLimit-Blocked", reputation.is_blocked.to_string()));
        if reputation.is_blocked {
            if let Some(reason) = &reputation.reason {
                headers.push(("X-RateLimit-Block-Reason", reason.clone()));
            }
        }
        headers.push(("X-RateLimit-Suspicious", reputation.is_suspicious.to_string()));
    }

    headers
}

/// In-memory fallback window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u64,
    /// Milliseconds since epoch
    pub reset_time: u64,
}

/// Fixed-window rate limiter backed by the key-value store.
///
/// Without a store (local development) or when the store fails on a fail-open call,
/// counting falls back to a process-local map. That map is not shared between
/// server instances and only approximates the limit under heavy concurrency.
pub struct RateLimiter {
    store: Option<Arc<dyn KeyValueStore>>,
    oracle: Arc<dyn ReputationOracle>,
    memory: Arc<Mutex<HashMap<String, RateLimitEntry>>>,
    reputation: Arc<LocalReputationTracker>,
    tiers: ReputationTiers,
    sweep_interval: Duration,
    cleanup_task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RateLimiter {
    /// Create a limiter with in-memory counting and no reputation oracle
    pub fn new(settings: &RateLimitSettings) -> Self {
        let capacity =
            NonZeroUsize::new(settings.reputation_capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            store: None,
            oracle: Arc::new(NoReputationOracle),
            memory: Arc::new(Mutex::new(HashMap::new())),
            reputation: Arc::new(LocalReputationTracker::new(capacity)),
            tiers: settings.tiers,
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs).max(MIN_SWEEP_INTERVAL),
            cleanup_task_handle: None,
        }
    }

    /// Count in the shared store instead of process memory
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ReputationOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Start the background sweep of expired fallback windows and decayed reputation
    pub fn start_cleanup_task(&mut self) {
        let memory = self.memory.clone();
        let reputation = self.reputation.clone();
        let sweep_interval = self.sweep_interval;

        info!("Starting rate limit sweep task (interval: {:?})", sweep_interval);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            // First tick fires immediately; nothing has expired yet.
            interval.tick().await;

            loop {
                interval.tick().await;
                sweep(&memory, &reputation, now_millis());
            }
        });

        if let Some(old_handle) = self.cleanup_task_handle.replace(handle) {
            old_handle.abort();
        }
    }

    pub fn stop_cleanup_task(&mut self) {
        if let Some(handle) = self.cleanup_task_handle.take() {
            handle.abort();
            info!("Rate limit sweep task stopped");
        }
    }

    /// Run one sweep immediately, returning how many entries were dropped
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.memory, &self.reputation, now_millis())
    }

    /// Check and count one request for `identifier`
    pub async fn rate_limit(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let ip = if config.check_reputation {
            parse_ip_literal(identifier)
        } else {
            None
        };

        match ip {
            Some(ip) => self.rate_limit_with_reputation(identifier, ip, config).await,
            None => {
                self.count(identifier, config.limit, config.window_in_seconds, config.fail_closed)
                    .await
            }
        }
    }

    async fn rate_limit_with_reputation(
        &self,
        identifier: &str,
        ip: IpAddr,
        config: &RateLimitConfig,
    ) -> RateLimitResult {
        let block_reason = self.oracle.block_reason(ip).await;
        if let Some(reason) = &block_reason {
            if self.tiers.malicious.block {
                warn!("Rejecting blocked IP {}: {}", ip, reason);
                return Self::refused(
                    config.limit,
                    self.tiers.malicious,
                    Classification::Malicious,
                    reason.clone(),
                );
            }
        }

        let (externally_suspicious, local) =
            join!(self.oracle.is_suspicious(ip), async { self.reputation.lookup(ip) });

        let local_class = local.map_or(Classification::Unknown, |e| e.classification());
        let listed = block_reason.is_some();
        let elevated = listed || externally_suspicious || local_class.is_elevated();

        let classification = if listed {
            Classification::Malicious
        } else if local_class.is_elevated() {
            local_class
        } else if externally_suspicious {
            Classification::Suspicious
        } else {
            Classification::Unknown
        };

        let reason = match (block_reason, local, externally_suspicious) {
            (Some(reason), _, _) => Some(reason),
            (None, Some(entry), _) if local_class.is_elevated() => Some(format!(
                "{} recent rate limit violations",
                entry.abuse_count
            )),
            (None, _, true) => Some("listed as suspicious".to_string()),
            _ => None,
        };

        let tier = if listed {
            Some(self.tiers.malicious)
        } else if elevated {
            Some(self.tiers.suspicious)
        } else {
            None
        };

        let (limit, window) = match tier {
            Some(tier) if tier.block => {
                warn!("Rejecting {} IP {} by tier policy", classification, ip);
                return Self::refused(
                    config.limit,
                    tier,
                    classification,
                    reason.unwrap_or_else(|| classification.to_string()),
                );
            }
            Some(tier) => {
                debug!(
                    "Applying {} tier to {} (local: {}, external: {})",
                    classification, ip, local_class, externally_suspicious
                );
                (config.limit.min(tier.limit), tier.window_secs)
            }
            None => (config.limit, config.window_in_seconds),
        };

        let mut result = self.count(identifier, limit, window, config.fail_closed).await;

        if !result.success {
            self.reputation.record_abuse(ip);
        }

        result.reputation = Some(ReputationInfo {
            is_blocked: false,
            is_suspicious: elevated,
            classification,
            reason,
        });
        result
    }

    /// Denial that bypasses the counter, resetting after the tier's window
    fn refused(
        limit: u64,
        tier: TierConfig,
        classification: Classification,
        reason: String,
    ) -> RateLimitResult {
        let reset = now_millis().saturating_add(tier.window_secs.saturating_mul(1000));
        let mut result = RateLimitResult::denied(limit, reset);
        result.reputation = Some(ReputationInfo {
            is_blocked: true,
            is_suspicious: true,
            classification,
            reason: Some(reason),
        });
        result
    }

    async fn count(
        &self,
        identifier: &str,
        limit: u64,
        window_secs: u64,
        fail_closed: bool,
    ) -> RateLimitResult {
        let Some(store) = &self.store else {
            return self.count_in_memory(identifier, limit, window_secs);
        };

        match count_in_store(store.as_ref(), identifier, limit, window_secs).await {
            Ok(result) => result,
            Err(e) if fail_closed => {
                warn!("Rate limit store error for {} (failing closed): {}", identifier, e);
                let reset = now_millis().saturating_add(window_secs.saturating_mul(1000));
                RateLimitResult::denied(limit, reset)
            }
            Err(e) => {
                warn!(
                    "Rate limit store error for {} (falling back to local counter): {}",
                    identifier, e
                );
                self.count_in_memory(identifier, limit, window_secs)
            }
        }
    }

    fn count_in_memory(&self, identifier: &str, limit: u64, window_secs: u64) -> RateLimitResult {
        let now = now_millis();
        let window_ms = window_secs.saturating_mul(1000);
        let mut windows = lock_or_recover(&self.memory, "rate limit fallback");

        let entry = windows
            .entry(identifier.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                reset_time: now.saturating_add(window_ms),
            });

        if entry.reset_time <= now {
            *entry = RateLimitEntry {
                count: 0,
                reset_time: now.saturating_add(window_ms),
            };
        }

        entry.count += 1;

        let result = RateLimitResult::from_count(entry.count, limit, entry.reset_time);
        if !result.success {
            debug!("Local rate limit exceeded for {} ({}/{})", identifier, entry.count, limit);
        }
        result
    }

    /// Local reputation for `identifier`, if it is an IP with recent abuse
    pub fn reputation_of(&self, identifier: &str) -> Option<IpReputationEntry> {
        parse_ip_literal(identifier).and_then(|ip| self.reputation.lookup(ip))
    }

    pub fn reputation_tracker(&self) -> &LocalReputationTracker {
        &self.reputation
    }

    /// Number of identifiers held by the in-memory fallback
    pub fn fallback_len(&self) -> usize {
        lock_or_recover(&self.memory, "rate limit fallback").len()
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop_cleanup_task();
    }
}

async fn count_in_store(
    store: &dyn KeyValueStore,
    identifier: &str,
    limit: u64,
    window_secs: u64,
) -> Result<RateLimitResult, StoreError> {
    let key = rate_limit_key(identifier);

    let count = store.incr(&key).await?;
    if count == 1 {
        store.expire(&key, window_secs).await?;
    }

    // Reset comes from the live TTL so every instance sees the same countdown.
    let ttl = store.pttl(&key).await?;
    let now = now_millis();
    let reset = if ttl > 0 {
        now + ttl as u64
    } else {
        if ttl == PTTL_NO_EXPIRY {
            warn!("Counter {} had no expiry, re-applying {}s window", key, window_secs);
            store.expire(&key, window_secs).await?;
        }
        now.saturating_add(window_secs.saturating_mul(1000))
    };

    let count = u64::try_from(count).unwrap_or(0);
    let result = RateLimitResult::from_count(count, limit, reset);
    if !result.success {
        debug!("Rate limit exceeded for {} ({}/{})", identifier, count, limit);
    }
    Ok(result)
}

fn sweep(
    memory: &Mutex<HashMap<String, RateLimitEntry>>,
    reputation: &LocalReputationTracker,
    now_ms: u64,
) -> usize {
    let removed_windows = {
        let mut windows = lock_or_recover(memory, "rate limit fallback");
        let before = windows.len();
        windows.retain(|_, entry| entry.reset_time > now_ms);
        before - windows.len()
    };

    if removed_windows > 0 {
        info!("Sweep removed {} expired rate limit windows", removed_windows);
    }

    removed_windows + reputation.sweep_decayed_at(now_ms)
}
