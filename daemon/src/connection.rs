use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::handlers;
use crate::protocol::{to_line, ErrorResponse, Request, AUTH_REQUIRED, INVALID_PARAMS, METHOD_AUTH};
use crate::state::{ClientId, DaemonState};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle a single client connection
pub async fn handle_client(stream: TcpStream, state: Arc<DaemonState>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    info!(%peer, "client connected");

    let (client_id, event_rx) = state.register_client().await;
    debug!(client_id, %peer, "assigned client id");

    if let Err(e) = handle_client_inner(stream, state.clone(), client_id, event_rx).await {
        debug!(%peer, error = %e, "client error");
    }

    info!(%peer, "client disconnected");
    state.unregister_client(client_id).await;
}

async fn handle_client_inner(
    stream: TcpStream,
    state: Arc<DaemonState>,
    client_id: ClientId,
    mut event_rx: mpsc::UnboundedReceiver<String>,
) -> Result<(), String> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    if state.token.is_some() {
        match timeout(AUTH_TIMEOUT, wait_for_auth(&mut reader, &mut writer, &state)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(client_id, "auth timeout");
                return Err("Auth timeout".to_string());
            }
        }
    }

    // Main loop: read requests and forward events
    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            let response = process_request(trimmed, state.clone(), client_id).await;
                            if let Err(e) = write_line(&mut writer, &response).await {
                                error!(error = %e, "failed to write response");
                                break;
                            }
                        }
                        line.clear();
                    }
                    Err(e) => {
                        debug!(error = %e, "read error");
                        break;
                    }
                }
            }

            Some(event) = event_rx.recv() => {
                if let Err(e) = write_line(&mut writer, &event).await {
                    error!(error = %e, "failed to write event");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Reads requests until a successful `auth`; anything else is refused.
async fn wait_for_auth(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    state: &DaemonState,
) -> Result<(), String> {
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => return Err("Connection closed".to_string()),
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let request: Request = match serde_json::from_str(trimmed) {
                    Ok(r) => r,
                    Err(e) => {
                        let resp = ErrorResponse::new(0, INVALID_PARAMS, format!("Invalid JSON: {e}"));
                        let _ = write_line(writer, &to_line(&resp)).await;
                        continue;
                    }
                };

                if request.method == METHOD_AUTH {
                    let response = handlers::auth::handle(&request, state).await;
                    let _ = write_line(writer, &response).await;
                    if handlers::auth::is_success(&response) {
                        return Ok(());
                    }
                    // Failed attempts may retry until the timeout.
                } else {
                    let resp = ErrorResponse::new(
                        request.id,
                        AUTH_REQUIRED,
                        "Authentication required. Send auth request first.",
                    );
                    let _ = write_line(writer, &to_line(&resp)).await;
                }
            }
            Err(e) => return Err(format!("Read error: {e}")),
        }
    }
}

/// Process a single request and return the JSON response line
async fn process_request(line: &str, state: Arc<DaemonState>, client_id: ClientId) -> String {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => handlers::dispatch(&request, state, client_id).await,
        Err(e) => to_line(&ErrorResponse::new(0, INVALID_PARAMS, format!("Invalid JSON: {e}"))),
    }
}
