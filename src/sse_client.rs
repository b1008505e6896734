use bytes::Bytes;
use eventsource_stream::{Event, Eventsource};
use futures::{future, stream, stream::BoxStream, Stream, StreamExt};
use log::debug;
use reqwest::{
    header::{ACCEPT, CACHE_CONTROL},
    Client as HttpClient,
};
/**
 * Connect to a remote MCP server over SSE.
 *
 * Server-to-client messages arrive on the event stream, client-to-server
 * messages are POSTed to the endpoint announced by the first `endpoint` event.
 */
use rmcp::{
    model::ClientInfo, service::RunningService, transport::async_rw::AsyncRwTransport, RoleClient,
    ServiceExt,
};
use serde_json::Value;
use std::{pin::Pin, task::Context, task::Poll, time::Duration};
use tokio::{io::AsyncWrite, sync::mpsc};
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};
use url::Url;

use crate::bridge::{client_info, ConnectError};

/// Configuration for the SSE client
pub struct SseClientConfig {
    pub url: Url,
    /// Carries default headers, proxies and timeouts.
    pub client: HttpClient,
    /// Deadline for the whole connect, from the stream request to the MCP handshake.
    pub handshake_timeout: Duration,
}

/// Forwards outgoing JSON-RPC lines to the message endpoint, in order.
struct SseWriter {
    buffer: Vec<u8>,
    tx: mpsc::UnboundedSender<Value>,
}

impl SseWriter {
    fn new(client: HttpClient, message_url: Url) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match client.post(message_url.clone()).json(&message).send().await {
                    Ok(response) if !response.status().is_success() => {
                        warn!("Message POST failed with status: {}", response.status());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Failed to send message: {}", e),
                }
            }
            debug!("SSE writer closed");
        });
        Self {
            buffer: Vec::new(),
            tx,
        }
    }

    fn send_line(&self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            warn!("Dropping non UTF-8 outgoing message");
            return;
        };
        if text.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(message) => {
                if self.tx.send(message).is_err() {
                    error!("SSE writer task is gone, dropping message");
                }
            }
            Err(e) => warn!("Dropping malformed outgoing message: {}", e),
        }
    }
}

impl AsyncWrite for SseWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let this = self.get_mut();
        this.buffer.extend_from_slice(buf);
        while let Some(pos) = this.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = this.buffer.drain(..=pos).collect();
            this.send_line(&line);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        if !this.buffer.is_empty() {
            let rest = std::mem::take(&mut this.buffer);
            this.send_line(&rest);
        }
        Poll::Ready(Ok(()))
    }
}

/// Message endpoint used when the server does not announce one.
pub fn fallback_message_url(sse_url: &Url) -> Url {
    let mut url = sse_url.clone();
    url.set_query(None);
    url.set_fragment(None);
    let base = url.path().trim_end_matches('/').trim_end_matches("/sse").to_string();
    url.set_path(&format!("{}/message", base));
    url
}

/// Resolve the `endpoint` event payload against the SSE URL.
pub fn resolve_endpoint(sse_url: &Url, data: &str) -> Result<Url, ConnectError> {
    sse_url
        .join(data.trim())
        .map_err(|e| ConnectError::Endpoint(format!("{:?}: {}", data, e)))
}

/// Turn the event stream into newline-delimited JSON-RPC for the reader.
/// Only `message` and unnamed events carry messages.
fn message_lines<S, E>(events: S) -> BoxStream<'static, std::io::Result<Bytes>>
where
    S: Stream<Item = Result<Event, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + std::fmt::Display,
{
    events
        .filter_map(|event_result| {
            future::ready(match event_result {
                Ok(event) if event.event.is_empty() || event.event == "message" => {
                    let mut data = event.data.into_bytes();
                    data.push(b'\n');
                    Some(Ok(Bytes::from(data)))
                }
                Ok(event) => {
                    debug!("Ignoring SSE event {:?}", event.event);
                    None
                }
                Err(e) => {
                    error!("SSE error: {}", e);
                    Some(Err(std::io::Error::other(e)))
                }
            })
        })
        .boxed()
}

/// Connect to the SSE endpoint and complete the MCP handshake.
///
/// `handshake_timeout` is a single deadline covering the stream request,
/// the endpoint event and the MCP initialize exchange.
pub async fn connect_sse(
    config: &SseClientConfig,
) -> Result<RunningService<RoleClient, ClientInfo>, ConnectError> {
    match tokio::time::timeout(config.handshake_timeout, establish(config)).await {
        Err(_) => Err(ConnectError::Timeout(config.handshake_timeout)),
        Ok(result) => result,
    }
}

async fn establish(
    config: &SseClientConfig,
) -> Result<RunningService<RoleClient, ClientInfo>, ConnectError> {
    info!("Connecting to SSE endpoint: {}", config.url);

    let response = config
        .client
        .get(config.url.clone())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ConnectError::Status(response.status()));
    }

    let mut events = Box::pin(response.bytes_stream().eventsource());

    let first = match events.next().await {
        None => return Err(ConnectError::Stream("stream closed before the first event".into())),
        Some(Err(e)) => return Err(ConnectError::Stream(e.to_string())),
        Some(Ok(event)) => event,
    };

    let (message_url, pending) = if first.event == "endpoint" {
        (resolve_endpoint(&config.url, &first.data)?, None)
    } else {
        debug!("First event is {:?}, using the default message endpoint", first.event);
        (fallback_message_url(&config.url), Some(first))
    };
    info!("Message endpoint: {}", message_url);

    let reader = StreamReader::new(message_lines(stream::iter(pending.map(Ok)).chain(events)));
    let writer = SseWriter::new(config.client.clone(), message_url);
    let transport = AsyncRwTransport::new(reader, writer);

    client_info()
        .serve(transport)
        .await
        .map_err(|e| ConnectError::Handshake(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn fallback_endpoint_replaces_sse_suffix() {
        assert_eq!(
            fallback_message_url(&url("http://localhost:8080/sse")).as_str(),
            "http://localhost:8080/message"
        );
        assert_eq!(
            fallback_message_url(&url("http://localhost:8080/mcp/sse/")).as_str(),
            "http://localhost:8080/mcp/message"
        );
        assert_eq!(
            fallback_message_url(&url("http://localhost:8080/sse?token=t")).as_str(),
            "http://localhost:8080/message"
        );
    }

    #[test]
    fn endpoint_event_is_resolved_relative_to_stream() {
        let sse = url("https://remote.example/mcp/sse?x=1");
        assert_eq!(
            resolve_endpoint(&sse, "/messages/?session_id=abc").unwrap().as_str(),
            "https://remote.example/messages/?session_id=abc"
        );
        assert_eq!(
            resolve_endpoint(&sse, "https://other.example/m\n").unwrap().as_str(),
            "https://other.example/m"
        );
    }

    #[tokio::test]
    async fn only_message_events_reach_the_reader() {
        let raw = concat!(
            ": keep-alive\n\n",
            "event: message\ndata: {\"id\":1}\n\n",
            "event: ping\ndata: {}\n\n",
            "data: {\"id\":2}\n\n",
            "event: endpoint\ndata: /other\n\n",
        );
        let events = stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(raw.as_bytes()))])
            .eventsource();

        let lines: Vec<Bytes> = message_lines(events)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(
            lines,
            vec![
                Bytes::from_static(b"{\"id\":1}\n"),
                Bytes::from_static(b"{\"id\":2}\n"),
            ]
        );
    }

    #[tokio::test]
    async fn one_deadline_covers_endpoint_and_handshake() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sse_url = url(&format!("http://{}/sse", listener.local_addr().unwrap()));
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n";
            socket.write_all(head).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            socket.write_all(b"event: endpoint\ndata: /message\n\n").await.unwrap();
            // initialize is never answered
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let config = SseClientConfig {
            url: sse_url,
            client: HttpClient::builder().no_proxy().build().unwrap(),
            handshake_timeout: Duration::from_millis(500),
        };
        let started = tokio::time::Instant::now();
        let err = connect_sse(&config).await.err().unwrap();

        assert!(matches!(err, ConnectError::Timeout(d) if d == Duration::from_millis(500)));
        assert!(started.elapsed() < Duration::from_millis(750), "{:?}", started.elapsed());
    }

    #[test]
    fn writer_splits_lines_and_keeps_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writer = SseWriter {
            buffer: Vec::new(),
            tx,
        };

        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let chunks: [&[u8]; 3] = [b"{\"id\":1}\n{\"id\"", b":2}\n", b"not json\n{\"id\":3}"];
        for chunk in chunks {
            assert!(matches!(
                Pin::new(&mut writer).poll_write(&mut cx, chunk),
                Poll::Ready(Ok(n)) if n == chunk.len()
            ));
        }
        let _ = Pin::new(&mut writer).poll_shutdown(&mut cx);

        let ids: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|v| v["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
