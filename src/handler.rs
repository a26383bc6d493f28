//! WebSocket connection handler.
//!
//! Manages individual WebSocket connections: parsing client messages,
//! routing them into the invitation coordinator and the aggregation runner,
//! and sending responses.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::protocol::{AvatarId, ClientMessage, ServerMessage};
use crate::state::SocialState;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Waits for a `Register` message to associate the connection with an
///    avatar id
/// 2. Spawns a sender task to forward outbound messages
/// 3. Processes incoming messages until the connection closes
pub async fn handle_websocket(socket: WebSocket, state: SocialState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create the outbound channel for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // ── Step 1: Wait for Registration ─────────────────────────────────────

    let avatar_id = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Register {
                        avatar_id,
                        name,
                        appearance,
                    }) => {
                        if avatar_id == 0 || name.is_empty() {
                            let err = ServerMessage::Error {
                                message: "Invalid registration".to_string(),
                            };
                            let _ = ws_sender
                                .send(Message::Text(serde_json::to_string(&err).unwrap()))
                                .await;
                            continue;
                        }

                        // Send registration confirmation
                        let ack = ServerMessage::Registered { avatar_id };
                        if ws_sender
                            .send(Message::Text(serde_json::to_string(&ack).unwrap()))
                            .await
                            .is_err()
                        {
                            return; // Connection closed
                        }

                        state
                            .sessions
                            .register(avatar_id, name, appearance, tx.clone());
                        break avatar_id;
                    }
                    Ok(ClientMessage::Ping) => {
                        let pong = ServerMessage::Pong;
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&pong).unwrap()))
                            .await;
                    }
                    Ok(_) => {
                        let err = ServerMessage::Error {
                            message: "Must register before sending other messages".to_string(),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse client message: {}", e);
                        let err = ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        };
                        let _ = ws_sender
                            .send(Message::Text(serde_json::to_string(&err).unwrap()))
                            .await;
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = ws_sender.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                return; // Connection closed before registration
            }
            _ => continue,
        }
    };

    tracing::info!(avatar = avatar_id, "WebSocket registered");

    // ── Step 2: Spawn Sender Task ─────────────────────────────────────────

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                }
            }
        }
    });

    // ── Step 3: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, avatar_id, client_msg);
                }
                Err(e) => {
                    // A code outside its closed set lands here too: malformed
                    // input is answered with an error, never guessed at.
                    tracing::warn!(
                        avatar = avatar_id,
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.sessions.send_to(
                        avatar_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Ping(_data)) => {
                state.sessions.send_to(avatar_id, ServerMessage::Pong);
            }
            Ok(Message::Close(_)) => {
                tracing::info!(avatar = avatar_id, "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(avatar = avatar_id, error = %e, "WebSocket error");
                break;
            }
            _ => {} // Binary, Pong: ignore
        }
    }

    // ── Step 4: Cleanup ───────────────────────────────────────────────────

    // Pending invites are left alone: clients cancel or answer them, and
    // the decline memory bounds any staleness they cause.
    state.sessions.unregister(avatar_id);
    sender_task.abort();
    tracing::info!(avatar = avatar_id, "WebSocket disconnected");
}

/// Route a parsed client message.
fn handle_client_message(state: &SocialState, sender: AvatarId, msg: ClientMessage) {
    match msg {
        ClientMessage::Register { .. } => {
            state.sessions.send_to(
                sender,
                ServerMessage::Error {
                    message: "Already registered".to_string(),
                },
            );
        }

        ClientMessage::FriendQuery { invitee_id } => {
            state.coordinator.friend_query(sender, invitee_id);
        }

        ClientMessage::CancelFriendQuery { context } => {
            state.coordinator.cancel_friend_query(sender, context);
        }

        ClientMessage::FriendConsidering { code, context } => {
            state.coordinator.invitee_considering(sender, code, context);
        }

        ClientMessage::FriendResponse { code, context } => {
            state.coordinator.invitee_response(sender, code, context);
        }

        ClientMessage::RequestSecret => {
            state.coordinator.request_secret(sender);
        }

        ClientMessage::SubmitSecret { secret } => {
            state.coordinator.submit_secret(sender, secret);
        }

        ClientMessage::GetFriendsList => {
            state.runner.get_friends_list(sender);
        }

        ClientMessage::GetAvatarDetails { avatar_id } => {
            state.runner.get_avatar_details(sender, avatar_id);
        }

        ClientMessage::Ping => {
            state.sessions.send_to(sender, ServerMessage::Pong);
        }
    }
}
