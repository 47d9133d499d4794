use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use guardian_core::{CommandDispatcher, DispatchError};
use guardian_types::events::{AgentMessage, ObserverRole, PresenceEvent};

use crate::AppState;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle one observer connection for its whole lifetime.
///
/// Dashboards get a full registry snapshot right after the Welcome so a
/// new tab is consistent immediately; a device agent instead gets a replay
/// of its pending command, which is how commands issued while the device
/// was offline reach it on reconnect.
pub async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    role: ObserverRole,
    device_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    let (session_id, mut events_rx) = state.channel.connect(role, device_id.clone()).await;
    info!("session {} ({:?}) connected", session_id, role);

    match role {
        ObserverRole::Dashboard => {
            let devices = state.registry.snapshot(None).await;
            state
                .channel
                .send_to_session(session_id, PresenceEvent::Snapshot { devices })
                .await;
        }
        ObserverRole::DeviceAgent => {
            if let Some(device_id) = device_id.clone() {
                replay_pending(&state, session_id, &device_id).await;
            }
        }
    }

    // Shared flag between heartbeat sender and pong receiver
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward channel events -> client, with ping/pong liveness
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = events_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read agent messages from the client
    let dispatcher = state.dispatcher.clone();
    let registry = state.registry.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
                    Ok(agent_msg) => {
                        handle_agent_message(&dispatcher, &registry, role, agent_msg).await;
                    }
                    Err(e) => {
                        warn!("session bad message: {} -- raw: {}", e, preview(&text, 200));
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.channel.disconnect(session_id).await;
    info!("session {} disconnected", session_id);
}

/// First `max` characters of a client-supplied string for logging. Cuts on
/// a char boundary, so arbitrary UTF-8 input can never panic the slice.
fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Push the device's outstanding command to a freshly connected agent.
async fn replay_pending(state: &AppState, session_id: uuid::Uuid, device_id: &str) {
    let db = state.db.clone();
    let id = device_id.to_string();
    let pending = tokio::task::spawn_blocking(move || db.get_pending(&id)).await;

    match pending {
        Ok(Ok(Some(command))) => {
            info!(
                "replaying pending command {} to reconnected {}",
                command.command_id, device_id
            );
            state
                .channel
                .send_to_session(
                    session_id,
                    PresenceEvent::CommandIssued {
                        device_id: command.device_id,
                        command_id: command.command_id,
                        action: command.action,
                        issued_by: command.issued_by,
                    },
                )
                .await;
        }
        Ok(Ok(None)) => {}
        Ok(Err(e)) => warn!("pending replay for {} failed: {}", device_id, e),
        Err(e) => warn!("spawn_blocking join error: {}", e),
    }
}

async fn handle_agent_message(
    dispatcher: &CommandDispatcher,
    registry: &guardian_core::DeviceRegistry,
    role: ObserverRole,
    msg: AgentMessage,
) {
    // Dashboards are read-only observers
    if role != ObserverRole::DeviceAgent {
        warn!("ignoring agent message from {:?} session", role);
        return;
    }

    match msg {
        AgentMessage::Heartbeat {
            device_id,
            reported_state,
        } => {
            if let Err(e) = registry
                .heartbeat(&device_id, reported_state, chrono::Utc::now())
                .await
            {
                warn!("heartbeat from unknown device {}: {}", device_id, e);
            }
        }
        AgentMessage::Ack {
            command_id,
            reported_state,
        } => match dispatcher.acknowledge(command_id, reported_state).await {
            Ok(_) => {}
            // Stale ack after a restart: log and drop, never fatal
            Err(DispatchError::CommandNotFound(id)) => {
                warn!("ack for unknown command {}, dropping", id);
            }
            Err(e) => {
                warn!("ack for command {} failed: {}", command_id, e);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::preview;

    #[test]
    fn preview_respects_char_boundaries() {
        // 300 multibyte chars: a naive byte slice at 200 would split one
        let text = "é".repeat(300);
        let cut = preview(&text, 200);
        assert_eq!(cut.chars().count(), 200);

        assert_eq!(preview("short", 200), "short");
        assert_eq!(preview("", 200), "");
    }
}
