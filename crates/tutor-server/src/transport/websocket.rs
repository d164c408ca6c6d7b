//! WebSocket listener using tokio-tungstenite.
//!
//! Clients connect to `/rpc/token/<token>`; any other path is refused with
//! 404 during the upgrade. Each connection carries JSON text frames.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tutor_core::{TutorError, TutorResult, MAX_FRAME_SIZE};

/// Path prefix of the RPC endpoint.
pub const RPC_PATH_PREFIX: &str = "/rpc/token/";

/// An accepted, upgraded WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Token taken from the request path.
    pub token: String,
}

/// Bind `bind_addr` and start accepting connections.
///
/// Returns the bound address and a receiver of upgraded connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> TutorResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TutorError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| TutorError::Transport(format!("WS local addr: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept(stream).await {
                            Ok((ws_stream, token)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    token,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    if tx.is_closed() {
                        break;
                    }
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

async fn accept(
    stream: TcpStream,
) -> TutorResult<(tokio_tungstenite::WebSocketStream<TcpStream>, String)> {
    let mut token = None;
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match parse_token(request.uri().path()) {
            Some(t) => {
                token = Some(t.to_string());
                Ok(response)
            }
            None => {
                let mut not_found = ErrorResponse::new(Some("not found".to_string()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Err(not_found)
            }
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| TutorError::Transport(format!("WS handshake: {e}")))?;
    let token = token.ok_or_else(|| TutorError::Transport("missing session token".into()))?;
    Ok((ws_stream, token))
}

/// Extract `<token>` from `/rpc/token/<token>`.
pub fn parse_token(path: &str) -> Option<&str> {
    let token = path.strip_prefix(RPC_PATH_PREFIX)?;
    let valid = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    valid.then_some(token)
}

/// Helper: send a text message over a WebSocket.
pub async fn ws_send_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    text: String,
) -> TutorResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| TutorError::Transport(format!("WS send failed: {e}")))
}

/// Helper: receive the next text message from a WebSocket.
///
/// Returns `None` if the connection is closed. Binary messages are ignored.
/// Rejects frames larger than 1 MiB.
pub async fn ws_recv_text(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
) -> TutorResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_SIZE {
                    return Err(TutorError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                        text.len()
                    )));
                }
                return Ok(Some(text.to_string()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(TutorError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

/// Helper: close the connection with a normal close frame.
pub async fn ws_close(ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>) {
    if let Err(e) = ws.close(None).await {
        debug!(error = %e, "WS close failed");
    }
}
