/**
 * Local stdio MCP server that forwards requests to the remote client session.
 */
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ClientInfo, Content, Implementation, ListToolsResult,
        PaginatedRequestParam, ServerInfo,
    },
    service::{NotificationContext, Peer, RequestContext, RunningService, ServiceError},
    Error, RoleClient, RoleServer, ServerHandler,
};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error as ThisError;
use tracing::debug;

use crate::retry::{retry, RetryPolicy};
use crate::utils::VERSION;

/// How forwarded requests are bounded and retried.
#[derive(Debug, Clone, Copy)]
pub struct ForwardSettings {
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

/// Name and instructions the local server advertises.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub name: String,
    /// Falls back to the remote server's instructions.
    pub instructions: Option<String>,
}

#[derive(Debug, ThisError)]
pub enum ForwardError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
}

impl ForwardError {
    /// Timeouts and transport failures may succeed on a second try, error
    /// responses from the remote server will not.
    pub fn is_transient(&self) -> bool {
        match self {
            ForwardError::TimedOut(_) => true,
            ForwardError::Service(
                ServiceError::McpError(_)
                | ServiceError::UnexpectedResponse
                | ServiceError::Cancelled { .. },
            ) => false,
            ForwardError::Service(_) => true,
        }
    }
}

/// A proxy handler that forwards requests to a client based on the server's capabilities
#[derive(Clone)]
pub struct ProxyHandler {
    client: Arc<RunningService<RoleClient, ClientInfo>>,
    cached_info: Arc<ServerInfo>,
    settings: ForwardSettings,
}

impl ServerHandler for ProxyHandler {
    fn get_info(&self) -> ServerInfo {
        self.cached_info.as_ref().clone()
    }

    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, Error> {
        let result = self
            .forward("list_tools", |peer| {
                let request = request.clone();
                async move { peer.list_tools(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!(
                    "Proxying list_tools response with {} tools",
                    result.tools.len()
                );
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error listing tools: {}", err);
                // Return empty list instead of error
                Ok(ListToolsResult::default())
            }
        }
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, Error> {
        let result = self
            .forward("call_tool", |peer| {
                let request = request.clone();
                async move { peer.call_tool(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!("Tool call {} succeeded", request.name);
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error calling tool {}: {}", request.name, err);
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Error: {}",
                    err
                ))]))
            }
        }
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::ListResourcesResult, Error> {
        if self.cached_info.capabilities.resources.is_none() {
            debug!("Remote server has no resources capability");
            return Ok(rmcp::model::ListResourcesResult::default());
        }

        let result = self
            .forward("list_resources", |peer| {
                let request = request.clone();
                async move { peer.list_resources(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!("Proxying list_resources response");
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error listing resources: {}", err);
                Ok(rmcp::model::ListResourcesResult::default())
            }
        }
    }

    async fn read_resource(
        &self,
        request: rmcp::model::ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::ReadResourceResult, Error> {
        if self.cached_info.capabilities.resources.is_none() {
            tracing::error!("Server doesn't support resources capability");
            return Err(Error::internal_error(
                "Server doesn't support resources capability".to_string(),
                None,
            ));
        }

        let result = self
            .forward("read_resource", |peer| {
                let request = request.clone();
                async move { peer.read_resource(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!("Proxying read_resource response for {}", request.uri);
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error reading resource {}: {}", request.uri, err);
                Err(Error::internal_error(
                    format!("Error reading resource: {}", err),
                    None,
                ))
            }
        }
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::ListResourceTemplatesResult, Error> {
        if self.cached_info.capabilities.resources.is_none() {
            debug!("Remote server has no resources capability");
            return Ok(rmcp::model::ListResourceTemplatesResult::default());
        }

        let result = self
            .forward("list_resource_templates", |peer| {
                let request = request.clone();
                async move { peer.list_resource_templates(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!("Proxying list_resource_templates response");
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error listing resource templates: {}", err);
                Ok(rmcp::model::ListResourceTemplatesResult::default())
            }
        }
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::ListPromptsResult, Error> {
        if self.cached_info.capabilities.prompts.is_none() {
            debug!("Remote server has no prompts capability");
            return Ok(rmcp::model::ListPromptsResult::default());
        }

        let result = self
            .forward("list_prompts", |peer| {
                let request = request.clone();
                async move { peer.list_prompts(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!("Proxying list_prompts response");
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error listing prompts: {}", err);
                Ok(rmcp::model::ListPromptsResult::default())
            }
        }
    }

    async fn get_prompt(
        &self,
        request: rmcp::model::GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::GetPromptResult, Error> {
        if self.cached_info.capabilities.prompts.is_none() {
            tracing::error!("Server doesn't support prompts capability");
            return Err(Error::internal_error(
                "Server doesn't support prompts capability".to_string(),
                None,
            ));
        }

        let result = self
            .forward("get_prompt", |peer| {
                let request = request.clone();
                async move { peer.get_prompt(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!("Proxying get_prompt response");
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error getting prompt: {}", err);
                Err(Error::internal_error(
                    format!("Error getting prompt: {}", err),
                    None,
                ))
            }
        }
    }

    async fn complete(
        &self,
        request: rmcp::model::CompleteRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<rmcp::model::CompleteResult, Error> {
        let result = self
            .forward("complete", |peer| {
                let request = request.clone();
                async move { peer.complete(request).await }
            })
            .await;

        match result {
            Ok(result) => {
                debug!("Proxying complete response");
                Ok(result)
            }
            Err(err) => {
                tracing::error!("Error completing: {}", err);
                Err(Error::internal_error(
                    format!("Error completing: {}", err),
                    None,
                ))
            }
        }
    }

    async fn on_progress(
        &self,
        notification: rmcp::model::ProgressNotificationParam,
        _context: NotificationContext<RoleServer>,
    ) {
        if let Err(err) = self.peer().notify_progress(notification).await {
            tracing::error!("Error notifying progress: {}", err);
        }
    }

    async fn on_cancelled(
        &self,
        notification: rmcp::model::CancelledNotificationParam,
        _context: NotificationContext<RoleServer>,
    ) {
        if let Err(err) = self.peer().notify_cancelled(notification).await {
            tracing::error!("Error notifying cancelled: {}", err);
        }
    }
}

impl ProxyHandler {
    /// Wrap a connected client. Returns `None` if the remote never sent its
    /// server info during the handshake.
    pub fn new(
        client: RunningService<RoleClient, ClientInfo>,
        identity: LocalIdentity,
        settings: ForwardSettings,
    ) -> Option<Self> {
        let peer_info = client.peer_info()?;

        // Forward the remote capabilities under the local identity
        let cached_info = ServerInfo {
            protocol_version: peer_info.protocol_version.clone(),
            server_info: Implementation {
                name: identity.name,
                version: VERSION.to_string(),
            },
            instructions: identity
                .instructions
                .or_else(|| peer_info.instructions.clone()),
            capabilities: peer_info.capabilities.clone(),
        };

        Some(Self {
            client: Arc::new(client),
            cached_info: Arc::new(cached_info),
            settings,
        })
    }

    fn peer(&self) -> Peer<RoleClient> {
        Peer::clone(&self.client)
    }

    async fn forward<T, F, Fut>(&self, label: &str, call: F) -> Result<T, ForwardError>
    where
        F: Fn(Peer<RoleClient>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let peer = self.peer();
        forward_with(&self.settings, label, || call(peer.clone())).await
    }
}

/// Run one forwarded request under the per-attempt timeout and the request
/// retry policy.
async fn forward_with<T, F, Fut>(
    settings: &ForwardSettings,
    label: &str,
    mut call: F,
) -> Result<T, ForwardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let timeout = settings.timeout;
    retry(&settings.retry, label, ForwardError::is_transient, || {
        let request = call();
        async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, request).await {
                    Ok(result) => result.map_err(ForwardError::from),
                    Err(_) => Err(ForwardError::TimedOut(limit)),
                },
                None => request.await.map_err(ForwardError::from),
            }
        }
    })
    .await
}
