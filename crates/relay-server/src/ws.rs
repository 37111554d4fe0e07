use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use relay_core::{conversation_stream, task_stream, EventBusError};
use relay_orchestrator::submit_task;
use relay_types::EngineEvent;
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

/// Websocket-layer close code for "stream already at its subscriber cap".
const CLOSE_TOO_MANY_SUBSCRIBERS: u16 = 4004;
/// Close code for a disallowed `Origin` header.
const CLOSE_ORIGIN_REJECTED: u16 = 4003;

#[derive(Deserialize)]
pub struct OriginQuery {
    /// Browsers can't set arbitrary headers on the websocket handshake
    /// from some clients, so the allowlist check also accepts the
    /// origin as a query parameter; the `Origin` header wins if present.
    origin: Option<String>,
}

fn request_origin(headers: &axum::http::HeaderMap, query: &OriginQuery) -> Option<String> {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.origin.clone())
}

pub async fn task_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<OriginQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let origin = request_origin(&headers, &query);
    if let Some(origin) = &origin {
        if !state.engine.config.origin_allowed(origin) {
            return ws.on_upgrade(move |socket| reject(socket, CLOSE_ORIGIN_REJECTED, "origin not allowed"));
        }
    }
    ws.on_upgrade(move |socket| task_stream_loop(socket, state, task_id))
}

pub async fn console_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<OriginQuery>,
    headers: axum::http::HeaderMap,
) -> impl IntoResponse {
    let origin = request_origin(&headers, &query);
    if let Some(origin) = &origin {
        if !state.engine.config.origin_allowed(origin) {
            return ws.on_upgrade(move |socket| reject(socket, CLOSE_ORIGIN_REJECTED, "origin not allowed"));
        }
    }
    ws.on_upgrade(move |socket| console_stream_loop(socket, state, conversation_id))
}

async fn reject(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// A full snapshot of a task's state, sent as the first frame on every
/// `/ws/task/{id}` connection so a client doesn't have to piece its view
/// together from the replay tail alone.
fn execution_snapshot(state: &AppState, task_id: &str) -> Option<EngineEvent> {
    let task = state.engine.store.get_task(task_id)?;
    let agents: Vec<_> = state
        .engine
        .store
        .agent_ids_for_task(task_id)
        .into_iter()
        .filter_map(|id| state.engine.store.get_agent(&id))
        .collect();
    let findings = state.engine.store.findings_for_task(task_id);
    let screenshots = state.engine.store.screenshots_for_task(task_id);
    Some(EngineEvent::new(
        "execution-snapshot",
        json!({"task": task, "agents": agents, "findings": findings, "screenshots": screenshots}),
    ))
}

async fn task_stream_loop(mut socket: WebSocket, state: AppState, task_id: String) {
    let stream_id = task_stream(&task_id);
    let (replay, mut subscription) = match state.engine.events.subscribe(&stream_id) {
        Ok(pair) => pair,
        Err(EventBusError::TooManySubscribers(_)) => {
            reject(socket, CLOSE_TOO_MANY_SUBSCRIBERS, "stream at subscriber cap").await;
            return;
        }
    };

    if let Some(snapshot) = execution_snapshot(&state, &task_id) {
        if send_event(&mut socket, &snapshot).await.is_err() {
            return;
        }
    }
    for question in state.engine.store.unanswered_questions_for_task(&task_id) {
        let event = EngineEvent::new(
            "clarification",
            json!({
                "question_id": question.id,
                "task_id": question.task_id,
                "prompt": question.prompt,
                "suggested_answers": question.suggested_answers,
            }),
        );
        if send_event(&mut socket, &event).await.is_err() {
            return;
        }
    }
    for event in &replay {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn console_stream_loop(mut socket: WebSocket, state: AppState, conversation_id: String) {
    let stream_id = conversation_stream(&conversation_id);
    let (replay, mut subscription) = match state.engine.events.subscribe(&stream_id) {
        Ok(pair) => pair,
        Err(EventBusError::TooManySubscribers(_)) => {
            reject(socket, CLOSE_TOO_MANY_SUBSCRIBERS, "stream at subscriber cap").await;
            return;
        }
    };

    for event in &replay {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if handle_console_frame(&state, &conversation_id, &text, &mut socket).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ConsoleFrame {
    UserMessage { text: String },
    ClarificationResponse { #[serde(rename = "questionId")] question_id: String, answer: String },
}

async fn handle_console_frame(state: &AppState, conversation_id: &str, raw: &str, socket: &mut WebSocket) -> Result<(), ()> {
    let frame: ConsoleFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(_) => return Ok(()),
    };

    match frame {
        ConsoleFrame::UserMessage { text } => {
            let task_id = match state.engine.conversations.active_task(conversation_id) {
                Some(task_id) => task_id,
                None => {
                    let task = submit_task(&state.engine, text.clone(), None, state.engine.config.projects_dir.clone());
                    state.engine.conversations.set_active_task(conversation_id, &task.id);
                    task.id
                }
            };
            let event = EngineEvent::new("console-text", json!({"conversation_id": conversation_id, "task_id": task_id, "text": text}));
            relay_orchestrator::publish_event(&state.engine, &task_id, event.clone());
            send_event(socket, &EngineEvent::new("conversation-update", json!({"conversation_id": conversation_id, "task_id": task_id}))).await
        }
        ConsoleFrame::ClarificationResponse { question_id, answer } => {
            let _ = relay_orchestrator::submit_question_answer(&state.engine, &question_id, answer);
            Ok(())
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &EngineEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).expect("EngineEvent always serializes");
    socket.send(WsMessage::Text(payload.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_frame_parses_user_message() {
        let frame: ConsoleFrame = serde_json::from_str(r#"{"type":"user-message","text":"hello"}"#).unwrap();
        assert!(matches!(frame, ConsoleFrame::UserMessage { text } if text == "hello"));
    }

    #[test]
    fn console_frame_parses_clarification_response() {
        let frame: ConsoleFrame =
            serde_json::from_str(r#"{"type":"clarification-response","questionId":"question-001","answer":"yes"}"#).unwrap();
        match frame {
            ConsoleFrame::ClarificationResponse { question_id, answer } => {
                assert_eq!(question_id, "question-001");
                assert_eq!(answer, "yes");
            }
            _ => panic!("wrong variant"),
        }
    }
}
