//! stdio transport: one session over newline-delimited JSON-RPC

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::error::ServerError;
use crate::server::McpServer;
use crate::session::ServerSession;

/// Serve the process's stdin/stdout until EOF.
pub async fn serve_stdio(server: McpServer) -> Result<(), ServerError> {
    run_stdio(server, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve one session over any reader/writer pair until the reader hits EOF.
pub async fn run_stdio<R, W>(server: McpServer, reader: R, writer: W) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !server.claim_stdio() {
        return Err(ServerError::Transport(
            "A stdio session is already running".to_string(),
        ));
    }

    let result = match server.open_session("stdio") {
        Ok(session) => {
            info!(session = %session.id(), "Starting MCP server in STDIO mode");
            let result = pump(&server, &session, reader, writer).await;
            server.close_session(session.id());
            result
        }
        Err(e) => Err(e),
    };

    server.release_stdio();
    result
}

async fn pump<R, W>(
    server: &McpServer,
    session: &ServerSession,
    reader: R,
    mut writer: W,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("EOF received, shutting down");
                break;
            }
            Ok(_) => {
                let Some(response) = server.handle_line(session, &line).await else {
                    continue;
                };
                writer.write_all(response.as_bytes()).await.map_err(write_failed)?;
                writer.write_all(b"\n").await.map_err(write_failed)?;
                writer.flush().await.map_err(write_failed)?;
            }
            Err(e) => {
                error!(error = %e, "Error reading from stdin");
                break;
            }
        }
        if session.is_closed() {
            break;
        }
    }

    Ok(())
}

fn write_failed(e: std::io::Error) -> ServerError {
    ServerError::Transport(format!("Failed to write response: {}", e))
}
