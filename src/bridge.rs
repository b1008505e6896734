/**
 * Entry point: turn options into a running proxy.
 *
 * resolve headers -> proxy settings -> HTTP client -> connect + probe
 * (with retries, optional SSE to Streamable HTTP fallback) -> `Bridge`.
 */
use rmcp::{
    model::{ClientCapabilities, ClientInfo, ServerInfo},
    service::RunningService,
    transport::stdio,
    RoleClient, ServerHandler, ServiceExt,
};
use std::{error::Error as StdError, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{BridgeOptions, ConfigError, EnvSnapshot, Timeouts, TransportKind},
    headers::{resolve_headers, to_header_map},
    proxy_config::{build_proxy_config, ProxyConfig},
    proxy_handler::{ForwardSettings, LocalIdentity, ProxyHandler},
    retry::retry,
    sse_client::{connect_sse, SseClientConfig},
    streamable_http_client::{connect_streamable_http, StreamableHttpClientConfig},
};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response status: {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid message endpoint: {0}")]
    Endpoint(String),
    #[error("event stream error: {0}")]
    Stream(String),
    #[error("MCP handshake failed: {0}")]
    Handshake(String),
    #[error("remote server sent no server info")]
    MissingServerInfo,
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ConnectError::Status(status) => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            ConnectError::Endpoint(_) | ConnectError::MissingServerInfo => false,
            ConnectError::Stream(_)
            | ConnectError::Handshake(_)
            | ConnectError::Probe(_)
            | ConnectError::Timeout(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to connect over {transport}: {source}")]
    Connect {
        transport: TransportKind,
        source: ConnectError,
    },
}

pub(crate) fn client_info() -> ClientInfo {
    ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        ..Default::default()
    }
}

/// A connected proxy, ready to be served over stdio.
pub struct Bridge {
    handler: ProxyHandler,
    transport: TransportKind,
}

impl Bridge {
    /// Transport the remote connection ended up using.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Server info advertised to the local client.
    pub fn server_info(&self) -> ServerInfo {
        self.handler.get_info()
    }

    /// Serve the local stdio MCP server until the client disconnects.
    pub async fn serve_stdio(self) -> Result<(), Box<dyn StdError>> {
        let server = self.handler.serve(stdio()).await?;
        server.waiting().await?;
        Ok(())
    }
}

/// Build the HTTP client every remote request goes through.
pub fn build_http_client(
    headers: reqwest::header::HeaderMap,
    proxy: &ProxyConfig,
    timeouts: &Timeouts,
    disable_http2: bool,
) -> Result<reqwest::Client, BridgeError> {
    let mut builder = reqwest::Client::builder().default_headers(headers);
    if let Some(connect) = timeouts.connect {
        builder = builder.connect_timeout(connect);
    }
    if let Some(read) = timeouts.sse_read {
        builder = builder.read_timeout(read);
    }
    if disable_http2 {
        builder = builder.http1_only();
    }
    builder = proxy.apply(builder)?;
    Ok(builder.build()?)
}

/// Resolve configuration, connect to the remote server and wrap it in a
/// [`Bridge`]. Configuration errors are reported before any network I/O.
pub async fn build_bridge(
    options: &BridgeOptions,
    env: &EnvSnapshot,
) -> Result<Bridge, BridgeError> {
    let url = options.remote_url(env)?;
    let headers = resolve_headers(options, env)?;
    let header_map = to_header_map(&headers)?;
    let proxy = build_proxy_config(options.proxy.as_deref(), options.socks.as_deref(), env);
    if !proxy.is_empty() {
        debug!(
            "Explicit proxies: http={} https={} all={}",
            proxy.http.is_some(),
            proxy.https.is_some(),
            proxy.all.is_some()
        );
    }
    let client = build_http_client(header_map, &proxy, &options.timeouts, options.disable_http2)?;

    let (service, transport) = connect(&url, &client, options).await?;

    let identity = LocalIdentity {
        name: options.name.clone(),
        instructions: options.instructions.clone(),
    };
    let settings = ForwardSettings {
        timeout: options.timeouts.request,
        retry: options.request_retry,
    };
    let handler = ProxyHandler::new(service, identity, settings).ok_or(BridgeError::Connect {
        transport,
        source: ConnectError::MissingServerInfo,
    })?;

    Ok(Bridge { handler, transport })
}

async fn connect(
    url: &Url,
    client: &reqwest::Client,
    options: &BridgeOptions,
) -> Result<(RunningService<RoleClient, ClientInfo>, TransportKind), BridgeError> {
    match options.transport {
        TransportKind::Auto => {
            match connect_with_retries(TransportKind::Sse, url, client, options).await {
                Ok(service) => Ok((service, TransportKind::Sse)),
                Err(e) => {
                    warn!("{}; falling back to streamable-http", e);
                    let service =
                        connect_with_retries(TransportKind::StreamableHttp, url, client, options)
                            .await?;
                    Ok((service, TransportKind::StreamableHttp))
                }
            }
        }
        kind => {
            let service = connect_with_retries(kind, url, client, options).await?;
            Ok((service, kind))
        }
    }
}

async fn connect_with_retries(
    transport: TransportKind,
    url: &Url,
    client: &reqwest::Client,
    options: &BridgeOptions,
) -> Result<RunningService<RoleClient, ClientInfo>, BridgeError> {
    let label = format!("{} probe", transport);
    let handshake_timeout = options.timeouts.handshake();

    retry(&options.startup_retry, &label, ConnectError::is_transient, || {
        connect_once(transport, url, client.clone(), handshake_timeout)
    })
    .await
    .map_err(|source| BridgeError::Connect { transport, source })
}

async fn connect_once(
    transport: TransportKind,
    url: &Url,
    client: reqwest::Client,
    handshake_timeout: Duration,
) -> Result<RunningService<RoleClient, ClientInfo>, ConnectError> {
    let service = match transport {
        TransportKind::StreamableHttp => {
            let config = StreamableHttpClientConfig {
                url: url.clone(),
                client,
                handshake_timeout,
            };
            connect_streamable_http(&config).await?
        }
        TransportKind::Sse | TransportKind::Auto => {
            let config = SseClientConfig {
                url: url.clone(),
                client,
                handshake_timeout,
            };
            connect_sse(&config).await?
        }
    };

    probe(&service, handshake_timeout).await?;
    Ok(service)
}

/// List tools once to make sure the session is usable, if the remote has any.
async fn probe(
    service: &RunningService<RoleClient, ClientInfo>,
    limit: Duration,
) -> Result<(), ConnectError> {
    let Some(info) = service.peer_info() else {
        return Err(ConnectError::MissingServerInfo);
    };
    info!("Connected to server: {}", info.server_info.name);

    if info.capabilities.tools.is_none() {
        return Ok(());
    }

    match tokio::time::timeout(limit, service.list_tools(None)).await {
        Err(_) => Err(ConnectError::Timeout(limit)),
        Ok(Err(e)) => Err(ConnectError::Probe(e.to_string())),
        Ok(Ok(tools)) => {
            debug!("Remote server exposes {} tools", tools.tools.len());
            Ok(())
        }
    }
}
