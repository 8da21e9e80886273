//! IP reputation: the external oracle seam and the local abuse tracker.
//!
//! The oracle answers from a maintained list or service ("blocked", "suspicious").
//! The local tracker counts rate-limit violations per IP and derives a classification
//! from the count and the age of the last violation. Callers can only record abuse;
//! classification is never assigned directly.

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ip_extraction::ip_in_cidr;
use crate::lock_utils::lock_or_recover;
use crate::time_utils::now_millis;

/// Abuse events before an IP is treated as suspicious
pub const SUSPICIOUS_THRESHOLD: u32 = 3;
/// Abuse events before an IP is treated as malicious
pub const MALICIOUS_THRESHOLD: u32 = 10;
/// Quiet period after which local reputation is forgotten (24 hours)
pub const REPUTATION_DECAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Reputation classification reported alongside rate-limit results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Malicious,
    Suspicious,
    Unknown,
    Benign,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Malicious => "malicious",
            Classification::Suspicious => "suspicious",
            Classification::Unknown => "unknown",
            Classification::Benign => "benign",
        }
    }

    /// Suspicious or worse
    pub fn is_elevated(&self) -> bool {
        matches!(self, Classification::Malicious | Classification::Suspicious)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification for a given abuse count
pub fn classify(abuse_count: u32) -> Classification {
    if abuse_count >= MALICIOUS_THRESHOLD {
        Classification::Malicious
    } else if abuse_count >= SUSPICIOUS_THRESHOLD {
        Classification::Suspicious
    } else {
        Classification::Unknown
    }
}

/// Local escalation record for one IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpReputationEntry {
    pub abuse_count: u32,
    /// Milliseconds since epoch
    pub last_abuse_time: u64,
}

impl IpReputationEntry {
    pub fn classification(&self) -> Classification {
        classify(self.abuse_count)
    }

    pub fn is_decayed_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_abuse_time) > REPUTATION_DECAY_MS
    }
}

/// Per-process abuse tracker.
///
/// Bounded by an LRU so a spray of distinct IPs evicts the least recently
/// abusive entries instead of growing without limit.
pub struct LocalReputationTracker {
    entries: Mutex<LruCache<IpAddr, IpReputationEntry>>,
}

impl LocalReputationTracker {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record one abuse event for `ip` and return the updated entry
    pub fn record_abuse(&self, ip: IpAddr) -> IpReputationEntry {
        self.record_abuse_at(ip, now_millis())
    }

    pub fn record_abuse_at(&self, ip: IpAddr, now_ms: u64) -> IpReputationEntry {
        let mut entries = lock_or_recover(&self.entries, "local ip reputation");

        let previous = entries
            .pop(&ip)
            .filter(|entry| !entry.is_decayed_at(now_ms));

        let entry = IpReputationEntry {
            abuse_count: previous.map_or(0, |e| e.abuse_count).saturating_add(1),
            last_abuse_time: now_ms,
        };

        let before = previous.map(|e| e.classification());
        if before != Some(entry.classification()) && entry.classification().is_elevated() {
            warn!(
                "IP {} escalated to {} after {} abuse events",
                ip,
                entry.classification(),
                entry.abuse_count
            );
        } else {
            debug!("Recorded abuse for {} (count: {})", ip, entry.abuse_count);
        }

        entries.put(ip, entry);
        entry
    }

    /// Current entry for `ip`, or None if it never abused or has decayed
    pub fn lookup(&self, ip: IpAddr) -> Option<IpReputationEntry> {
        self.lookup_at(ip, now_millis())
    }

    pub fn lookup_at(&self, ip: IpAddr, now_ms: u64) -> Option<IpReputationEntry> {
        let mut entries = lock_or_recover(&self.entries, "local ip reputation");
        let entry = *entries.peek(&ip)?;

        if entry.is_decayed_at(now_ms) {
            debug!("Reputation for {} decayed, forgetting", ip);
            entries.pop(&ip);
            return None;
        }
        Some(entry)
    }

    /// Classification for `ip`; absent entries read as unknown
    pub fn classification_at(&self, ip: IpAddr, now_ms: u64) -> Classification {
        self.lookup_at(ip, now_ms)
            .map_or(Classification::Unknown, |e| e.classification())
    }

    /// Drop every decayed entry, returning how many were removed
    pub fn sweep_decayed(&self) -> usize {
        self.sweep_decayed_at(now_millis())
    }

    pub fn sweep_decayed_at(&self, now_ms: u64) -> usize {
        let mut entries = lock_or_recover(&self.entries, "local ip reputation");
        let stale: Vec<IpAddr> = entries
            .iter()
            .filter(|(_, entry)| entry.is_decayed_at(now_ms))
            .map(|(ip, _)| *ip)
            .collect();

        for ip in &stale {
            entries.pop(ip);
        }

        if !stale.is_empty() {
            info!("Reputation sweep removed {} decayed entries", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries, "local ip reputation").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// External reputation source consulted before counting a request
#[async_trait]
pub trait ReputationOracle: Send + Sync {
    /// Why `ip` is permanently blocked, or None when it is not
    async fn block_reason(&self, ip: IpAddr) -> Option<String>;

    /// Whether `ip` should get the tighter suspicious budget
    async fn is_suspicious(&self, ip: IpAddr) -> bool;
}

/// Oracle that knows nothing; every IP is neither blocked nor suspicious
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReputationOracle;

#[async_trait]
impl ReputationOracle for NoReputationOracle {
    async fn block_reason(&self, _ip: IpAddr) -> Option<String> {
        None
    }

    async fn is_suspicious(&self, _ip: IpAddr) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
enum IpMatcher {
    Exact(IpAddr),
    Cidr(String),
}

impl IpMatcher {
    /// Exact IP or CIDR range; a range is accepted when it matches its own network address
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.contains('/') {
            let network = entry.split('/').next()?.parse::<IpAddr>().ok()?;
            if ip_in_cidr(network, entry) {
                return Some(IpMatcher::Cidr(entry.to_string()));
            }
            None
        } else {
            entry.parse().ok().map(IpMatcher::Exact)
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            IpMatcher::Exact(addr) => *addr == ip,
            IpMatcher::Cidr(range) => ip_in_cidr(ip, range),
        }
    }
}

/// Oracle backed by a maintained list of IPs and CIDR ranges
#[derive(Debug, Clone, Default)]
pub struct StaticReputationList {
    blocked: Vec<(IpMatcher, String)>,
    suspicious: Vec<IpMatcher>,
}

impl StaticReputationList {
    /// Build from `(ip or cidr, reason)` pairs and a suspicious list.
    ///
    /// Unparseable entries are logged and skipped.
    pub fn new<B, S>(blocked: B, suspicious: S) -> Self
    where
        B: IntoIterator<Item = (String, String)>,
        S: IntoIterator<Item = String>,
    {
        let blocked = blocked
            .into_iter()
            .filter_map(|(entry, reason)| match IpMatcher::parse(&entry) {
                Some(matcher) => Some((matcher, reason)),
                None => {
                    warn!("Ignoring invalid blocklist entry: {}", entry);
                    None
                }
            })
            .collect();

        let suspicious = suspicious
            .into_iter()
            .filter_map(|entry| {
                let matcher = IpMatcher::parse(&entry);
                if matcher.is_none() {
                    warn!("Ignoring invalid suspicious-list entry: {}", entry);
                }
                matcher
            })
            .collect();

        Self {
            blocked,
            suspicious,
        }
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    pub fn suspicious_len(&self) -> usize {
        self.suspicious.len()
    }
}

#[async_trait]
impl ReputationOracle for StaticReputationList {
    async fn block_reason(&self, ip: IpAddr) -> Option<String> {
        self.blocked
            .iter()
            .find(|(matcher, _)| matcher.matches(ip))
            .map(|(_, reason)| reason.clone())
    }

    async fn is_suspicious(&self, ip: IpAddr) -> bool {
        self.suspicious.iter().any(|matcher| matcher.matches(ip))
    }
}
