//! WebSocket chat channel: recv loop, request dispatch, event forwarding.
//!
//! Each connection subscribes to its session's event bus; progress frames
//! stream from a forwarder task while the recv loop processes one client
//! frame at a time. Terminal frames (`complete`, `checkpoint`, `error`)
//! come from the turn outcome so every turn ends in exactly one of them.
//! Malformed frames get an `error` reply and the channel stays open.

use std::sync::Arc;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::frames::{ClientFrame, ServerFrame};
use super::http::{AppState, SessionQuery, session_id_from};
use super::SessionRuntime;
use crate::executor::{ExecutorError, TurnOutcome};
use crate::orchestrator::ExecutionOutcome;

type WsSender = Arc<Mutex<SplitSink<WebSocket, WsMessage>>>;

pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let session_id = session_id_from(&headers, &query)
        .unwrap_or_else(|| state.mint_session_id());
    upgrade.on_upgrade(move |socket| async move {
        let runtime = state.get_or_create(&session_id).await;
        handle_socket(socket, runtime).await;
    })
}

async fn send_frame(sender: &WsSender, frame: &ServerFrame) -> bool {
    let Ok(text) = serde_json::to_string(frame) else {
        return false;
    };
    sender
        .lock()
        .await
        .send(WsMessage::Text(text.into()))
        .await
        .is_ok()
}

async fn handle_socket(socket: WebSocket, runtime: Arc<SessionRuntime>) {
    let (sink, mut stream) = socket.split();
    let sender: WsSender = Arc::new(Mutex::new(sink));

    // Session context first, so a reconnecting client can offer resume.
    match runtime.orchestrator.session_context().await {
        Ok(context) => {
            send_frame(&sender, &ServerFrame::SessionContext { context }).await;
        }
        Err(err) => warn!(error = %err, "session context unavailable"),
    }

    // Forward progress events until the connection (or the bus) closes.
    let forwarder = {
        let sender = Arc::clone(&sender);
        let mut events = runtime.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(frame) = ServerFrame::from_event(&event) {
                            if !send_frame(&sender, &frame).await {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "read error (client closed?)");
                break;
            }
        };
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                send_frame(
                    &sender,
                    &ServerFrame::error(format!("invalid frame: {err}")),
                )
                .await;
                continue;
            }
        };

        if !dispatch(&runtime, &sender, frame).await {
            break;
        }
    }

    forwarder.abort();
    debug!(session = %runtime.session_id, "connection closed");
}

/// Handle one client frame; returns false when the connection should end.
async fn dispatch(runtime: &Arc<SessionRuntime>, sender: &WsSender, frame: ClientFrame) -> bool {
    match frame {
        ClientFrame::UserMessage { content, files } => {
            match runtime.executor.process_message(&content, files).await {
                Ok(TurnOutcome::Complete { response }) => {
                    send_frame(sender, &ServerFrame::Complete { response }).await
                }
                Ok(TurnOutcome::Checkpoint { task }) => {
                    send_frame(sender, &ServerFrame::checkpoint(task)).await
                }
                Err(ExecutorError::Busy) => send_frame(sender, &ServerFrame::error("busy")).await,
                Err(err) => send_frame(sender, &ServerFrame::error(err.to_string())).await,
            }
        }
        ClientFrame::CheckpointResponse { feedback, approved } => {
            match runtime
                .orchestrator
                .resume_from_checkpoint(&feedback, approved)
                .await
            {
                Ok(ExecutionOutcome::Completed { final_output }) => {
                    // The resumed board finished; persist the reply exactly
                    // as a normal turn would.
                    match runtime.executor.complete_resumed_board(final_output).await {
                        Ok(response) => {
                            send_frame(sender, &ServerFrame::Complete { response }).await
                        }
                        Err(err) => {
                            send_frame(sender, &ServerFrame::error(err.to_string())).await
                        }
                    }
                }
                Ok(ExecutionOutcome::Checkpoint { task }) => {
                    send_frame(sender, &ServerFrame::checkpoint(task)).await
                }
                Ok(ExecutionOutcome::Failed { message }) => {
                    send_frame(sender, &ServerFrame::error(message)).await
                }
                Err(err) => send_frame(sender, &ServerFrame::error(err.to_string())).await,
            }
        }
        ClientFrame::AbandonTask => {
            let message = match runtime.orchestrator.abandon().await {
                Ok(true) => "Task abandoned.".to_string(),
                Ok(false) => "No active task to abandon.".to_string(),
                Err(err) => {
                    return send_frame(sender, &ServerFrame::error(err.to_string())).await;
                }
            };
            send_frame(sender, &ServerFrame::Status { message }).await
        }
        ClientFrame::GetStatus => match runtime.orchestrator.session_context().await {
            Ok(context) => send_frame(sender, &ServerFrame::SessionContext { context }).await,
            Err(err) => send_frame(sender, &ServerFrame::error(err.to_string())).await,
        },
    }
}
