// Library interface for the site guard: rate limiting, sessions and MCP integrity.
// The binary in main.rs wires these into a small hyper server.

pub mod config;
pub mod error;
pub mod ip_extraction;
pub mod kv_store;
pub mod lock_utils;
pub mod mcp_integrity;
pub mod rate_limiter;
pub mod reputation;
pub mod server;
pub mod session;
pub mod session_crypto;
pub mod time_utils;
pub mod timing_safe;
