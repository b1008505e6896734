/**
 * Outbound proxy settings.
 *
 * `--proxy` and `--socks` are shorthands for the standard proxy variables.
 * Instead of writing them into the process environment, the effective
 * settings are collected here and registered on the HTTP client directly.
 */
use log::debug;
use reqwest::{ClientBuilder, NoProxy, Proxy};

use crate::config::{ConfigError, EnvSnapshot, Result};

pub const HTTP_PROXY: &str = "HTTP_PROXY";
pub const HTTPS_PROXY: &str = "HTTPS_PROXY";
pub const ALL_PROXY: &str = "ALL_PROXY";

/// Effective proxy URL per scheme. An empty config leaves the HTTP client
/// on its own environment lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
    pub all: Option<String>,
}

/// Look up a proxy variable the way HTTP clients do: upper case first, then
/// lower case. Empty values count as unset.
fn proxy_var<'a>(env: &'a EnvSnapshot, name: &str) -> Option<&'a str> {
    env.get_non_empty(name)
        .or_else(|| env.get_non_empty(&name.to_ascii_lowercase()))
}

/// Derive the proxy settings from the CLI shorthands and the environment.
///
/// Values already present in the environment always win over the flags.
pub fn build_proxy_config(
    proxy: Option<&str>,
    socks: Option<&str>,
    env: &EnvSnapshot,
) -> ProxyConfig {
    let proxy = proxy.filter(|p| !p.trim().is_empty());
    let socks = socks.filter(|s| !s.trim().is_empty());
    if proxy.is_none() && socks.is_none() {
        return ProxyConfig::default();
    }

    let env_http = proxy_var(env, HTTP_PROXY);
    let env_https = proxy_var(env, HTTPS_PROXY);
    let (http, https) = match proxy {
        Some(url) if env_http.is_none() && env_https.is_none() => {
            debug!("Using --proxy {} for HTTP and HTTPS", url);
            (Some(url), Some(url))
        }
        _ => (env_http, env_https),
    };

    let all = match (proxy_var(env, ALL_PROXY), socks) {
        (Some(existing), _) => Some(existing),
        (None, Some(url)) => {
            debug!("Using --socks {} for all schemes", url);
            Some(url)
        }
        (None, None) => None,
    };

    ProxyConfig {
        http: http.map(str::to_string),
        https: https.map(str::to_string),
        all: all.map(str::to_string),
    }
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.https.is_none() && self.all.is_none()
    }

    /// Register the proxies on a client builder. `NO_PROXY` from the
    /// environment still applies to each of them.
    pub fn apply(&self, mut builder: ClientBuilder) -> Result<ClientBuilder> {
        if let Some(url) = &self.http {
            let proxy = Proxy::http(url).map_err(|e| invalid(url, e))?;
            builder = builder.proxy(proxy.no_proxy(NoProxy::from_env()));
        }
        if let Some(url) = &self.https {
            let proxy = Proxy::https(url).map_err(|e| invalid(url, e))?;
            builder = builder.proxy(proxy.no_proxy(NoProxy::from_env()));
        }
        if let Some(url) = &self.all {
            let proxy = Proxy::all(url).map_err(|e| invalid(url, e))?;
            builder = builder.proxy(proxy.no_proxy(NoProxy::from_env()));
        }
        Ok(builder)
    }
}

fn invalid(url: &str, source: reqwest::Error) -> ConfigError {
    ConfigError::InvalidProxy {
        url: url.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvSnapshot {
        pairs.iter().copied().collect()
    }

    #[test]
    fn proxy_flag_sets_both_when_unset() {
        let cfg = build_proxy_config(Some("http://p:8080"), None, &env(&[]));
        assert_eq!(cfg.http.as_deref(), Some("http://p:8080"));
        assert_eq!(cfg.https.as_deref(), Some("http://p:8080"));
        assert_eq!(cfg.all, None);
    }

    #[test]
    fn existing_http_proxy_is_kept() {
        let cfg = build_proxy_config(
            Some("http://p:8080"),
            None,
            &env(&[(HTTP_PROXY, "http://existing")]),
        );
        assert_eq!(cfg.http.as_deref(), Some("http://existing"));
        assert_eq!(cfg.https, None);
    }

    #[test]
    fn existing_https_proxy_blocks_the_flag() {
        let cfg = build_proxy_config(
            Some("http://p:8080"),
            None,
            &env(&[("https_proxy", "http://lower")]),
        );
        assert_eq!(cfg.http, None);
        assert_eq!(cfg.https.as_deref(), Some("http://lower"));
    }

    #[test]
    fn empty_env_value_counts_as_unset() {
        let cfg = build_proxy_config(Some("http://p:8080"), None, &env(&[(HTTP_PROXY, "")]));
        assert_eq!(cfg.http.as_deref(), Some("http://p:8080"));
    }

    #[test]
    fn socks_flag_sets_all_proxy_unless_present() {
        let cfg = build_proxy_config(None, Some("socks5://127.0.0.1:1080"), &env(&[]));
        assert_eq!(cfg.all.as_deref(), Some("socks5://127.0.0.1:1080"));

        let cfg = build_proxy_config(
            None,
            Some("socks5://127.0.0.1:1080"),
            &env(&[(ALL_PROXY, "socks5://existing:1")]),
        );
        assert_eq!(cfg.all.as_deref(), Some("socks5://existing:1"));
    }

    #[test]
    fn no_flags_leaves_client_defaults() {
        let cfg = build_proxy_config(None, None, &env(&[(HTTP_PROXY, "http://existing")]));
        assert!(cfg.is_empty());
    }

    #[test]
    fn apply_rejects_bad_urls() {
        let cfg = ProxyConfig {
            http: Some("http://p:8080".into()),
            https: None,
            all: Some("socks5://127.0.0.1:1080".into()),
        };
        assert!(cfg.apply(reqwest::Client::builder()).is_ok());

        let bad = ProxyConfig {
            http: Some("::not a url::".into()),
            ..Default::default()
        };
        assert!(matches!(
            bad.apply(reqwest::Client::builder()),
            Err(ConfigError::InvalidProxy { .. })
        ));
    }
}
