//! Loopback OAuth callback listener
//!
//! Binds `127.0.0.1` only and answers the first request it receives: the
//! browser redirect carrying `code` and `state` (or `error`). The outcome is
//! recorded in a [`CallbackResult`] and the listener stops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::AuthError;

/// Fixed port registered with the Coordinator for the CLI client
pub const LOCAL_CALLBACK_PORT: u16 = 9905;

pub const STATE_MISMATCH_ERROR: &str = "Invalid state parameter. Possible CSRF attack.";
pub const MISSING_CODE_ERROR: &str = "No authorization code received.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LINE_BYTES: u64 = 8 * 1024;
const MAX_HEADER_LINES: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackResult {
    pub code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Starting,
    Listening(SocketAddr),
    Failed(String),
}

pub struct OAuthCallbackServer {
    ready_rx: watch::Receiver<Readiness>,
    done_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    result: Arc<Mutex<CallbackResult>>,
    requested_port: u16,
}

impl OAuthCallbackServer {
    /// Spawn the listener task. Use [`wait_until_ready`](Self::wait_until_ready)
    /// before handing out the redirect URI.
    pub fn start(state: impl Into<String>, port: u16) -> Self {
        let state = state.into();
        let (ready_tx, ready_rx) = watch::channel(Readiness::Starting);
        let (done_tx, done_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = Arc::new(Mutex::new(CallbackResult::default()));

        let task_result = result.clone();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(port, error = %e, "Failed to bind OAuth callback listener");
                    let _ = ready_tx.send(Readiness::Failed(e.to_string()));
                    return;
                }
            };
            let addr = match listener.local_addr() {
                Ok(a) => a,
                Err(e) => {
                    let _ = ready_tx.send(Readiness::Failed(e.to_string()));
                    return;
                }
            };

            info!(address = %addr, "OAuth callback listener ready");
            let _ = ready_tx.send(Readiness::Listening(addr));

            serve(listener, state, task_result, done_tx, shutdown_rx).await;
            debug!(address = %addr, "OAuth callback listener stopped");
        });

        Self {
            ready_rx,
            done_rx,
            shutdown_tx,
            result,
            requested_port: port,
        }
    }

    /// Wait for the listener to be bound.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<SocketAddr, AuthError> {
        let mut rx = self.ready_rx.clone();
        let readiness = tokio::time::timeout(timeout, rx.wait_for(|r| *r != Readiness::Starting))
            .await
            .map_err(|_| AuthError::CallbackServer("timed out waiting for listener".into()))?
            .map_err(|_| AuthError::CallbackServer("listener task exited".into()))?
            .clone();

        match readiness {
            Readiness::Listening(addr) => Ok(addr),
            Readiness::Failed(msg) => Err(AuthError::CallbackServer(msg)),
            Readiness::Starting => Err(AuthError::CallbackServer("listener not started".into())),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.ready_rx.borrow() {
            Readiness::Listening(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn port(&self) -> u16 {
        self.local_addr().map(|a| a.port()).unwrap_or(self.requested_port)
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.port())
    }

    /// Wait for the callback to arrive. Returns `false` on timeout, in which
    /// case the result carries a timeout error and the listener is stopped.
    pub async fn wait_for_result(&self, timeout: Duration) -> bool {
        let mut rx = self.done_rx.clone();
        if let Ok(Ok(_)) = tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            return true;
        }

        let message = format!(
            "Timed out waiting for the login callback after {}s. If your browser completed login, \
             check firewall/antivirus settings and re-run 'arcade login' (you can increase --timeout if needed).",
            timeout.as_secs()
        );
        if let Ok(mut result) = self.result.lock() {
            result.error = Some(message);
        }
        self.shutdown();
        false
    }

    pub fn result(&self) -> CallbackResult {
        self.result.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for OAuthCallbackServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    listener: TcpListener,
    state: String,
    result: Arc<Mutex<CallbackResult>>,
    done_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<CallbackResult>(1);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Error accepting callback connection");
                        continue;
                    }
                };
                debug!(peer = %peer, "Callback connection");

                // Idle sockets (browser preconnects) must not block the redirect
                let state = state.clone();
                let outcome_tx = outcome_tx.clone();
                tokio::spawn(async move {
                    let handled = handle_callback(socket, &state);
                    match tokio::time::timeout(REQUEST_TIMEOUT, handled).await {
                        Ok(Ok(outcome)) => {
                            let _ = outcome_tx.send(outcome).await;
                        }
                        Ok(Err(e)) => warn!(peer = %peer, error = %e, "Malformed callback request"),
                        Err(_) => debug!(peer = %peer, "Dropping idle callback connection"),
                    }
                });
            }
            Some(outcome) = outcome_rx.recv() => {
                if let Ok(mut r) = result.lock() {
                    *r = outcome;
                }
                let _ = done_tx.send(true);
                break;
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Read one line of at most `MAX_LINE_BYTES`.
async fn read_bounded_line<R>(reader: &mut R, line: &mut String) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let read = reader.take(MAX_LINE_BYTES).read_line(line).await?;
    if read as u64 == MAX_LINE_BYTES && !line.ends_with('\n') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request line too long"));
    }
    Ok(read)
}

/// Read one HTTP request, answer it, and report what it carried.
async fn handle_callback(
    mut socket: TcpStream,
    expected_state: &str,
) -> std::io::Result<CallbackResult> {
    let mut reader = BufReader::new(&mut socket);
    let mut request_line = String::new();
    if read_bounded_line(&mut reader, &mut request_line).await? == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"));
    }

    // Drain headers
    let mut header = String::new();
    for _ in 0..MAX_HEADER_LINES {
        header.clear();
        if read_bounded_line(&mut reader, &mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
    }

    // "GET /callback?code=...&state=... HTTP/1.1"
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty request line"))?;
    let query = target.split_once('?').map(|(_, q)| q).unwrap_or("");
    let params = parse_query_params(query);

    let outcome = evaluate(&params, expected_state);
    let (status, html) = match &outcome.error {
        None => (
            "200 OK",
            page("Login successful", "You can close this tab and return to your terminal."),
        ),
        Some(err) => ("400 Bad Request", page("Login failed", err)),
    };
    send_response(&mut socket, status, html).await?;
    Ok(outcome)
}

fn evaluate(params: &HashMap<String, String>, expected_state: &str) -> CallbackResult {
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return CallbackResult {
            code: None,
            error: Some(STATE_MISMATCH_ERROR.to_string()),
        };
    }

    if let Some(error) = params.get("error") {
        let message = params
            .get("error_description")
            .filter(|d| !d.is_empty())
            .unwrap_or(error);
        return CallbackResult {
            code: None,
            error: Some(message.clone()),
        };
    }

    match params.get("code").filter(|c| !c.is_empty()) {
        Some(code) => CallbackResult {
            code: Some(code.clone()),
            error: None,
        },
        None => CallbackResult {
            code: None,
            error: Some(MISSING_CODE_ERROR.to_string()),
        },
    }
}

fn parse_query_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key.to_string(), value))
        })
        .collect()
}

async fn send_response(socket: &mut TcpStream, status: &str, html: String) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        html.len(),
        html
    );
    socket.write_all(response.as_bytes()).await?;
    socket.flush().await
}

fn page(title: &str, message: &str) -> String {
    let escaped = message
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Arcade - {title}</title></head>\n\
         <body style=\"font-family: sans-serif; text-align: center; margin-top: 4rem;\">\n\
         <h1>{title}</h1>\n<p>{escaped}</p>\n</body>\n</html>"
    )
}
