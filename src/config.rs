use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::headers::TemplateSource;
use crate::retry::RetryPolicy;

/// Inline JSON header template, lowest precedence source.
pub const MCP_HEADER_TEMPLATE: &str = "MCP_HEADER_TEMPLATE";
/// Path to a JSON header template file.
pub const MCP_HEADER_FILE: &str = "MCP_HEADER_FILE";
/// Remote SSE endpoint when `--sse` is not given.
pub const MCP_REMOTE_SSE: &str = "MCP_REMOTE_SSE";

pub const DEFAULT_SERVER_NAME: &str = "Proxy Bridge";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read header template file {}: {source}", .path.display())]
    TemplateRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid header template from {origin}: {source}")]
    TemplateParse {
        origin: TemplateSource,
        source: serde_json::Error,
    },
    #[error("invalid header template from {origin}: {reason}")]
    TemplateShape {
        origin: TemplateSource,
        reason: String,
    },
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("invalid proxy URL {url:?}: {source}")]
    InvalidProxy {
        url: String,
        source: reqwest::Error,
    },
    #[error("a remote URL is required, pass --sse or set MCP_REMOTE_SSE")]
    MissingUrl,
    #[error("invalid remote URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Process environment captured once at startup.
///
/// Used as a read-only lookup table for placeholder substitution and for
/// proxy variable checks. Nothing in the crate writes to the real environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        // Non-unicode entries can't be substituted into header values anyway.
        std::env::vars_os()
            .filter_map(|(k, v): (OsString, OsString)| {
                Some((k.into_string().ok()?, v.into_string().ok()?))
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Like [`get`](Self::get), but treats an empty or whitespace-only value as unset.
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Remote transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TransportKind {
    #[default]
    Sse,
    StreamableHttp,
    /// SSE first, Streamable HTTP if SSE cannot be established.
    Auto,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Sse => f.write_str("sse"),
            TransportKind::StreamableHttp => f.write_str("streamable-http"),
            TransportKind::Auto => f.write_str("auto"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    /// TCP/TLS connect, also the deadline for establishing the MCP session.
    pub connect: Option<Duration>,
    /// Whole MCP request as seen by the stdio client.
    pub request: Option<Duration>,
    /// Idle gap between reads on the event stream.
    pub sse_read: Option<Duration>,
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        self.connect.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

/// Everything needed to build a [`Bridge`](crate::bridge::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Remote URL; falls back to `MCP_REMOTE_SSE`.
    pub url: Option<String>,
    pub header_template: Option<String>,
    /// Falls back to `MCP_HEADER_FILE`.
    pub header_file: Option<PathBuf>,
    pub headers: Vec<(String, String)>,
    pub proxy: Option<String>,
    pub socks: Option<String>,
    pub name: String,
    pub instructions: Option<String>,
    pub timeouts: Timeouts,
    pub startup_retry: RetryPolicy,
    pub request_retry: RetryPolicy,
    pub transport: TransportKind,
    pub disable_http2: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            url: None,
            header_template: None,
            header_file: None,
            headers: Vec::new(),
            proxy: None,
            socks: None,
            name: DEFAULT_SERVER_NAME.to_string(),
            instructions: None,
            timeouts: Timeouts::default(),
            startup_retry: RetryPolicy::startup_default(),
            request_retry: RetryPolicy::request_default(),
            transport: TransportKind::default(),
            disable_http2: false,
        }
    }
}

impl BridgeOptions {
    /// Remote URL from the options, else from the environment, validated.
    pub fn remote_url(&self, env: &EnvSnapshot) -> Result<Url> {
        let raw = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| env.get_non_empty(MCP_REMOTE_SSE))
            .ok_or(ConfigError::MissingUrl)?;

        Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
            url: raw.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_snapshot_treats_blank_as_unset() {
        let env: EnvSnapshot = [("A", "1"), ("B", ""), ("C", "  ")].into_iter().collect();
        assert_eq!(env.get("A"), Some("1"));
        assert_eq!(env.get("B"), Some(""));
        assert_eq!(env.get_non_empty("B"), None);
        assert_eq!(env.get_non_empty("C"), None);
        assert_eq!(env.get_non_empty("D"), None);
    }

    #[test]
    fn remote_url_prefers_options_over_env() {
        let env: EnvSnapshot = [(MCP_REMOTE_SSE, "http://env.example/sse")]
            .into_iter()
            .collect();
        let opts = BridgeOptions {
            url: Some("http://flag.example/sse".into()),
            ..Default::default()
        };
        assert_eq!(
            opts.remote_url(&env).unwrap().as_str(),
            "http://flag.example/sse"
        );

        let opts = BridgeOptions::default();
        assert_eq!(
            opts.remote_url(&env).unwrap().as_str(),
            "http://env.example/sse"
        );
    }

    #[test]
    fn remote_url_missing_or_invalid() {
        let env = EnvSnapshot::default();
        assert!(matches!(
            BridgeOptions::default().remote_url(&env),
            Err(ConfigError::MissingUrl)
        ));

        let opts = BridgeOptions {
            url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(matches!(
            opts.remote_url(&env),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
