/**
 * The entry point for the mcp-proxy-bridge application.
 * It sets up logging, resolves configuration and serves the remote server over stdio.
 */
use clap::{ArgAction, Parser};
use mcp_proxy_bridge::{
    build_bridge,
    config::{Timeouts, DEFAULT_SERVER_NAME},
    headers::parse_header_override,
    retry::RetryPolicy,
    BridgeOptions, EnvSnapshot, TransportKind, VERSION,
};
use std::{error::Error, path::PathBuf, process, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// MCP Proxy Bridge CLI arguments
#[derive(Parser, Debug)]
#[command(
    name = "mcp-proxy-bridge",
    version = env!("CARGO_PKG_VERSION"),
    about = concat!("MCP Proxy Bridge v", env!("CARGO_PKG_VERSION"), ". Expose a remote SSE MCP server as a local stdio MCP server."),
    long_about = None,
    after_help = "Examples:\n  \
        Connect to a remote SSE server:\n  \
        mcp-proxy-bridge --sse https://example.com/mcp/sse\n\n  \
        Send an API token taken from the environment:\n  \
        MCP_HEADER_TEMPLATE='{\"Authorization\":\"Bearer ${API_TOKEN}\"}' mcp-proxy-bridge --sse https://example.com/sse\n\n  \
        Add headers and go through a local proxy:\n  \
        mcp-proxy-bridge --sse https://example.com/sse -H X-Team=core --proxy http://127.0.0.1:7890\n\n  \
        Retry the startup probe with a 5-30s backoff window:\n  \
        mcp-proxy-bridge --sse https://example.com/sse --retries 5 --retry-min 5 --retry-max 30 --retry-jitter 0.2
",
)]
struct Cli {
    /// Remote SSE (or Streamable HTTP) endpoint
    #[arg(long = "sse", env = "MCP_REMOTE_SSE", value_name = "URL")]
    sse: Option<String>,

    /// Name of the local stdio server
    #[arg(long = "name", default_value = DEFAULT_SERVER_NAME)]
    name: String,

    /// Instructions of the local stdio server
    #[arg(long = "instructions")]
    instructions: Option<String>,

    /// Extra header, overrides the template. Can be used multiple times.
    #[arg(
        short = 'H',
        long = "header",
        value_name = "KEY=VALUE",
        value_parser = parse_header_override
    )]
    headers: Vec<(String, String)>,

    /// Inline JSON header template, values may use ${ENV_NAME}
    #[arg(long = "header-template", value_name = "JSON")]
    header_template: Option<String>,

    /// JSON header template file. Defaults to MCP_HEADER_FILE.
    #[arg(long = "header-file", value_name = "PATH")]
    header_file: Option<PathBuf>,

    /// HTTP/HTTPS proxy, used when HTTP_PROXY and HTTPS_PROXY are unset
    #[arg(long = "proxy", value_name = "URL")]
    proxy: Option<String>,

    /// SOCKS proxy, used when ALL_PROXY is unset
    #[arg(long = "socks", value_name = "URL")]
    socks: Option<String>,

    /// Log filter (e.g. debug, info, warn). Defaults to RUST_LOG, then info.
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Do not print the startup banner
    #[arg(long = "no-banner", action = ArgAction::SetFalse)]
    show_banner: bool,

    /// Connect timeout in seconds, also bounds the MCP handshake
    #[arg(long = "connect-timeout", value_name = "SECS", value_parser = parse_seconds)]
    connect_timeout: Option<Duration>,

    /// Timeout in seconds for each forwarded MCP request
    #[arg(long = "request-timeout", value_name = "SECS", value_parser = parse_seconds)]
    request_timeout: Option<Duration>,

    /// Idle read timeout in seconds on the event stream
    #[arg(long = "sse-read-timeout", value_name = "SECS", value_parser = parse_seconds)]
    sse_read_timeout: Option<Duration>,

    /// Startup probe attempts, including the first
    #[arg(long = "retries", default_value_t = 1)]
    retries: u32,

    /// Startup backoff base in seconds (delay = base * 2^(attempt-1))
    #[arg(long = "retry-backoff", value_name = "SECS", default_value_t = 2.0)]
    retry_backoff: f64,

    /// Lower bound of the startup backoff in seconds
    #[arg(long = "retry-min", value_name = "SECS")]
    retry_min: Option<f64>,

    /// Upper bound of the startup backoff in seconds
    #[arg(long = "retry-max", value_name = "SECS")]
    retry_max: Option<f64>,

    /// Startup backoff jitter ratio (0-1), e.g. 0.2 for +/-20%
    #[arg(long = "retry-jitter", value_name = "RATIO", default_value_t = 0.0)]
    retry_jitter: f64,

    /// Attempts per forwarded MCP request, including the first. 0 disables retries.
    #[arg(long = "request-retries", default_value_t = 0)]
    request_retries: u32,

    /// Request backoff base in seconds
    #[arg(long = "request-retry-backoff", value_name = "SECS", default_value_t = 1.0)]
    request_retry_backoff: f64,

    /// Lower bound of the request backoff in seconds
    #[arg(long = "request-retry-min", value_name = "SECS")]
    request_retry_min: Option<f64>,

    /// Upper bound of the request backoff in seconds
    #[arg(long = "request-retry-max", value_name = "SECS")]
    request_retry_max: Option<f64>,

    /// Request backoff jitter ratio (0-1)
    #[arg(long = "request-retry-jitter", value_name = "RATIO", default_value_t = 0.0)]
    request_retry_jitter: f64,

    /// Remote transport. auto tries SSE first, then Streamable HTTP.
    #[arg(long = "transport", value_enum, default_value_t = TransportKind::Sse)]
    transport: TransportKind,

    /// Force HTTP/1.1
    #[arg(long = "no-http2", action = ArgAction::SetTrue)]
    disable_http2: bool,
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .parse()
        .map_err(|_| format!("expected a number of seconds, got {:?}", raw))?;
    if secs <= 0.0 {
        return Err(format!("timeout must be positive, got {}", secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

impl Cli {
    fn into_options(self) -> BridgeOptions {
        BridgeOptions {
            url: self.sse,
            header_template: self.header_template,
            header_file: self.header_file,
            headers: self.headers,
            proxy: self.proxy,
            socks: self.socks,
            name: self.name,
            instructions: self.instructions,
            timeouts: Timeouts {
                connect: self.connect_timeout,
                request: self.request_timeout,
                sse_read: self.sse_read_timeout,
            },
            startup_retry: RetryPolicy {
                attempts: self.retries,
                base: self.retry_backoff,
                min: self.retry_min,
                max: self.retry_max,
                jitter: self.retry_jitter,
            },
            request_retry: RetryPolicy {
                attempts: self.request_retries,
                base: self.request_retry_backoff,
                min: self.request_retry_min,
                max: self.request_retry_max,
                jitter: self.request_retry_jitter,
            },
            transport: self.transport,
            disable_http2: self.disable_http2,
        }
    }
}

/// Accept the level names other MCP tooling uses as well.
fn log_filter(level: Option<&str>) -> EnvFilter {
    let Some(level) = level else {
        return EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    };
    let normalized = match level.to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    };
    EnvFilter::try_new(&normalized).unwrap_or_else(|e| {
        eprintln!("Invalid log level {:?} ({}), using info", level, e);
        EnvFilter::new("info")
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Logs go to stderr, stdout carries the MCP stream
    tracing_subscriber::registry()
        .with(log_filter(cli.log_level.as_deref()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let show_banner = cli.show_banner;
    let env = EnvSnapshot::capture();
    let options = cli.into_options();
    let target = options
        .remote_url(&env)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| "<unset>".to_string());

    if show_banner {
        eprintln!(
            "mcp-proxy-bridge v{} | name={} | remote={} | transport={}",
            VERSION, options.name, target, options.transport
        );
    }
    info!("Starting v{} name={} remote={}", VERSION, options.name, target);

    let bridge = match build_bridge(&options, &env).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Startup failed: {}", e);
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    info!("Serving stdio over {} transport", bridge.transport());

    bridge.serve_stdio().await?;
    Ok(())
}
