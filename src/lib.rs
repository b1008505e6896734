//! MCP Proxy Bridge Library
//!
//! Exposes a remote MCP server (SSE or Streamable HTTP) as a local stdio server:
//! 1. Header templates from a flag, file or environment variable, with `${VAR}` substitution
//! 2. Proxy settings from `--proxy`/`--socks` that never override the environment
//! 3. Startup probe and request-level retries around the remote session

pub mod bridge;
pub mod config;
pub mod headers;
pub mod proxy_config;
pub mod proxy_handler;
pub mod retry;
pub mod sse_client;
pub mod streamable_http_client;
mod utils;

// Export main functions
pub use self::bridge::{build_bridge, Bridge, BridgeError};
pub use self::config::{BridgeOptions, ConfigError, EnvSnapshot, TransportKind};
pub use self::utils::VERSION;
