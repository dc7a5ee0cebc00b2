use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::oneshot;
use tracing::{info, warn};

use arcade_mcp::observability::init_tracing;
use arcade_mcp::toolkits::default_catalog;
use arcade_mcp::transport::serve_stdio;
use arcade_mcp::{
    ArcadeAuthorizer, HttpStreamableTransport, LoggingMiddleware, McpServer, MessageProcessor,
    ServerSettings, SseTransport, Worker,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Stdio,
    Sse,
    Http,
    All,
}

#[derive(Parser, Debug)]
#[command(name = "arcade-mcp", version, about = "Serve Arcade tools over MCP")]
struct Args {
    #[arg(long, value_enum, env = "ARCADE_MCP_TRANSPORT", default_value = "stdio")]
    transport: Transport,

    #[arg(long, env = "ARCADE_MCP_HOST")]
    host: Option<String>,

    #[arg(long, env = "ARCADE_MCP_PORT")]
    port: Option<u16>,

    #[arg(long, env = "ARCADE_MCP_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Skip bearer auth on the worker and MCP routes
    #[arg(long)]
    disable_auth: bool,

    #[arg(long, env = "ARCADE_WORKER_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[arg(long, env = "ARCADE_MCP_NAME")]
    name: Option<String>,

    #[arg(long, env = "ARCADE_MCP_INSTRUCTIONS")]
    instructions: Option<String>,
}

impl Args {
    fn settings(&self) -> ServerSettings {
        let mut settings = ServerSettings::from_env();
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(max) = self.max_connections {
            settings.max_connections = max;
        }
        if self.disable_auth {
            settings.disable_auth = true;
        }
        if let Some(secret) = &self.secret {
            settings.worker_secret = Some(secret.clone());
        }
        if let Some(name) = &self.name {
            settings.name = name.clone();
        }
        if let Some(instructions) = &self.instructions {
            settings.instructions = Some(instructions.clone());
        }
        settings.user_email = arcade_auth::Config::load()
            .ok()
            .and_then(|c| c.user_email().map(str::to_string));
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("info");

    let settings = args.settings();
    let catalog = Arc::new(default_catalog()?);
    info!(tools = catalog.len(), hash = %catalog.catalog_hash(), "Loaded tool catalog");

    let processor = MessageProcessor::new().with(Arc::new(LoggingMiddleware::default()));
    let mut builder = McpServer::builder(catalog).settings(settings.clone()).processor(processor);
    match &settings.api_key {
        Some(key) => {
            let authorizer = ArcadeAuthorizer::new(&settings.engine_url, key)?;
            builder = builder.authorizer(Arc::new(authorizer));
        }
        None => warn!("ARCADE_API_KEY is not set; tools that need authorization will fail"),
    }
    let server = builder.build();

    if args.transport == Transport::Stdio {
        serve_stdio(server.clone()).await?;
        server.shutdown();
        return Ok(());
    }

    let mut worker = Worker::new(server.clone(), None)?;
    if matches!(args.transport, Transport::Sse | Transport::All) {
        worker = worker.with_component(Arc::new(SseTransport::new(server.clone())));
    }
    if matches!(args.transport, Transport::Http | Transport::All) {
        worker = worker.with_component(Arc::new(HttpStreamableTransport::new(server.clone())));
    }

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", settings.host, settings.port))?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serving = worker.serve(addr, async move {
        let _ = stop_rx.await;
    });
    tokio::pin!(serving);

    tokio::select! {
        result = &mut serving => return Ok(result?),
        _ = tokio::signal::ctrl_c() => {}
    }

    info!("Shutting down");
    server.shutdown();
    let _ = stop_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, serving).await {
        Ok(result) => result?,
        Err(_) => warn!("Open streams did not close in time"),
    }
    Ok(())
}
