use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

/// Identifier used when no header yields a client IP
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Configuration for IP extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpExtractionConfig {
    /// Ordered list of headers to check for client IP
    pub trusted_headers: Vec<String>,
}

impl Default for IpExtractionConfig {
    fn default() -> Self {
        Self {
            trusted_headers: vec!["x-forwarded-for".to_string(), "x-real-ip".to_string()],
        }
    }
}

/// IP extraction result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpSource {
    /// IP taken from a forwarding header
    Header { ip: String, header: String },
    /// No usable header; the rate limiter keys these requests as "unknown"
    Unknown,
}

impl IpSource {
    pub fn ip(&self) -> &str {
        match self {
            IpSource::Header { ip, .. } => ip,
            IpSource::Unknown => UNKNOWN_CLIENT,
        }
    }
}

/// Extract the client IP from forwarding headers.
///
/// `x-forwarded-for` may hold "client, proxy1, proxy2"; only the leftmost entry is used.
pub fn extract_client_ip(config: &IpExtractionConfig, headers: &[(String, String)]) -> IpSource {
    for header_name in &config.trusted_headers {
        if let Some(header_value) = find_header(headers, header_name) {
            if let Some(client_ip) = extract_leftmost_ip(&header_value) {
                if is_valid_ip(&client_ip) {
                    log::debug!("Extracted client IP {} from header {}", client_ip, header_name);
                    return IpSource::Header {
                        ip: client_ip,
                        header: header_name.clone(),
                    };
                }
                log::warn!("Invalid IP {:?} in header {}, skipping", client_ip, header_name);
            }
        }
    }

    IpSource::Unknown
}

/// Shorthand for `extract_client_ip` with the default header order
pub fn client_ip_from_headers(headers: &[(String, String)]) -> String {
    extract_client_ip(&IpExtractionConfig::default(), headers)
        .ip()
        .to_string()
}

/// Parse an identifier as an IPv4 or IPv6 literal
pub fn parse_ip_literal(identifier: &str) -> Option<IpAddr> {
    if identifier.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return None;
    }
    IpAddr::from_str(identifier).ok()
}

/// CIDR membership for both address families.
///
/// Returns false for malformed ranges or mismatched families.
pub fn ip_in_cidr(ip: IpAddr, cidr: &str) -> bool {
    let Some((network_addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix_len) = prefix.parse::<u32>() else {
        return false;
    };
    let Ok(network) = IpAddr::from_str(network_addr) else {
        return false;
    };

    match (ip, network) {
        (IpAddr::V4(ip_v4), IpAddr::V4(net_v4)) if prefix_len <= 32 => {
            let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
            (u32::from(ip_v4) & mask) == (u32::from(net_v4) & mask)
        }
        (IpAddr::V6(ip_v6), IpAddr::V6(net_v6)) if prefix_len <= 128 => {
            let mask = if prefix_len == 0 { 0 } else { !0u128 << (128 - prefix_len) };
            (u128::from(ip_v6) & mask) == (u128::from(net_v6) & mask)
        }
        _ => false,
    }
}

/// Example: "203.0.113.1, 198.51.100.2" -> "203.0.113.1"
fn extract_leftmost_ip(header_value: &str) -> Option<String> {
    header_value
        .split(',')
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Find a header value (case-insensitive)
fn find_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

/// Rejects control characters outright so header injection never reaches a store key.
fn is_valid_ip(ip: &str) -> bool {
    parse_ip_literal(ip).is_some()
}
