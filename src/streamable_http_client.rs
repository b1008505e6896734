use rmcp::{
    model::ClientInfo,
    service::RunningService,
    transport::streamable_http_client::{
        StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    },
    RoleClient, ServiceExt,
};
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::bridge::{client_info, ConnectError};

/// Configuration for the Streamable HTTP client
pub struct StreamableHttpClientConfig {
    pub url: Url,
    pub client: reqwest::Client,
    pub handshake_timeout: Duration,
}

/// Connect to a Streamable HTTP endpoint and complete the MCP handshake.
pub async fn connect_streamable_http(
    config: &StreamableHttpClientConfig,
) -> Result<RunningService<RoleClient, ClientInfo>, ConnectError> {
    info!("Connecting to Streamable HTTP endpoint: {}", config.url);

    let transport_config = StreamableHttpClientTransportConfig::with_uri(config.url.to_string());
    let transport =
        StreamableHttpClientTransport::with_client(config.client.clone(), transport_config);

    match tokio::time::timeout(config.handshake_timeout, client_info().serve(transport)).await {
        Err(_) => Err(ConnectError::Timeout(config.handshake_timeout)),
        Ok(Err(e)) => Err(ConnectError::Handshake(e.to_string())),
        Ok(Ok(client)) => Ok(client),
    }
}
