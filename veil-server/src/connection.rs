use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::messages::{ClientFrame, MePayload, ServerFrame};
use crate::state::ServerState;
use crate::store::Identity;

/// Clients send `keep-alive` every 30s; drop connections silent for longer.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const INVALID_MESSAGE: &str = "Invalid message";

/// The form-decoded `token` parameter of a request query string.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Run the upgrade handshake, authenticating the session token from the
/// request URI. Unauthenticated sockets get a 401 and never reach the registry.
pub async fn accept_connection(stream: TcpStream, peer_addr: SocketAddr, state: Arc<ServerState>) {
    let mut identity: Option<Identity> = None;

    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let Some(token) = token_from_query(req.uri().query()) else {
            warn!(%peer_addr, "Rejected connection without session token");
            return Err(unauthorized());
        };
        match state.validate_session(&token) {
            Some(user) => {
                identity = Some(user);
                Ok(resp)
            }
            None => {
                warn!(%peer_addr, "Rejected connection with invalid session token");
                Err(unauthorized())
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!(%peer_addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    match identity {
        Some(identity) => handle_connection(ws_stream, identity, state).await,
        None => error!(%peer_addr, "Handshake completed without an identity"),
    }
}

/// Serve one authenticated connection until it closes.
pub async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    identity: Identity,
    state: Arc<ServerState>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Create channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = state.registry.add_client(identity.clone(), tx.clone());
    info!(user_id = %identity.id, %connection_id, "User connected");

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            res = timeout(CLIENT_IDLE_TIMEOUT, ws_receiver.next()) => {
                match res {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        // Frames may wait on sqlite; keep them off the runtime workers
                        let frame_state = state.clone();
                        let frame_identity = identity.clone();
                        let reply = tokio::task::spawn_blocking(move || {
                            handle_frame(&text, &frame_identity, &frame_state)
                        })
                        .await;
                        match reply {
                            Ok(Some(reply)) => {
                                if !send_reply(&tx, &reply) {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => error!(user_id = %identity.id, error = %e, "Frame handler failed"),
                        }
                    }
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        warn!(user_id = %identity.id, "Rejected binary frame");
                        if !send_reply(&tx, &ServerFrame::error(INVALID_MESSAGE)) {
                            break;
                        }
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        info!(user_id = %identity.id, "Client sent close frame");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        error!(user_id = %identity.id, error = %e, "WebSocket error");
                        break;
                    }
                    Ok(None) => {
                        info!(user_id = %identity.id, "WebSocket stream ended");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Err(_) => {
                        warn!(user_id = %identity.id, "Closing idle connection");
                        break;
                    }
                }
            }
            // Write errors end the send task
            _ = &mut send_task => {
                info!(user_id = %identity.id, "Send task finished (likely connection lost)");
                break;
            }
        }
    }

    // Cleanup
    send_task.abort();
    state.registry.remove_client(&identity.id, connection_id);
    info!(user_id = %identity.id, %connection_id, "User disconnected");
}

/// Queue `reply` for this connection. False once the writer is gone.
fn send_reply(tx: &mpsc::UnboundedSender<String>, reply: &ServerFrame) -> bool {
    match reply.to_json() {
        Ok(json) => tx.send(json).is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to serialize reply");
            true
        }
    }
}

/// Handle one inbound text frame. Returns the reply for this connection, if any.
///
/// The sender of every relayed event is the authenticated `identity`, never a
/// field of the frame.
pub fn handle_frame(text: &str, identity: &Identity, state: &ServerState) -> Option<ServerFrame> {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(user_id = %identity.id, error = %e, "Rejected frame");
            return Some(ServerFrame::error(INVALID_MESSAGE));
        }
    };

    match frame {
        ClientFrame::KeepAlive => None,
        ClientFrame::Me => Some(ServerFrame::Me(MePayload {
            id: identity.id.clone(),
            username: identity.username.clone(),
            name: identity.name.clone(),
        })),
        ClientFrame::Event(data) => match state.post_event(identity, &data) {
            Ok(_) => None,
            Err(e) => {
                warn!(user_id = %identity.id, chat = %data.chat, error = %e, "Event rejected");
                Some(ServerFrame::error(e.client_message()))
            }
        },
    }
}
