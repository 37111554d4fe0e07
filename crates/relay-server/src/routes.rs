use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::tokens_match;
use relay_orchestrator::{
    ask_question, await_many, await_one, await_question_answer, spawn_agent, submit_question_answer,
    submit_task, task_not_found, SpawnRequest, AWAIT_MANY_MAX_TIMEOUT,
};
use relay_types::{DynamicAgent, PendingQuestion, Task};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

/// The router's public surface: a minimal task submit/poll pair needed
/// to drive the engine from a CLI or test harness, and the full
/// Internal Coordination API behind the shared-token middleware.
///
/// Returns a `Router<AppState>` still awaiting its state -- the caller
/// merges in the websocket routes and calls `.with_state(...)` once,
/// since state must be attached after every route is nested in.
pub fn router(state: AppState) -> Router<AppState> {
    let internal = Router::new()
        .route("/question", post(create_question))
        .route("/question/{id}/answer", get(get_question_answer).post(post_question_answer))
        .route("/spawn-agent", post(spawn_agent_route))
        .route("/agent/{id}/status", get(agent_status))
        .route("/agent/{id}/result", get(agent_result))
        .route("/spawn-agents", post(spawn_agents_batch))
        .route("/agents/wait", post(agents_wait))
        .layer(axum::middleware::from_fn_with_state(state, require_sidechannel_token));

    Router::new()
        .route("/task", post(create_task))
        .route("/task/{id}", get(get_task))
        .nest("/internal", internal)
}

/// Constant-time token check against the per-process shared secret.
/// Mirrors this codebase's `x-<product>-token` header convention, with
/// an `Authorization: Bearer` fallback.
async fn require_sidechannel_token(State(state): State<AppState>, headers: HeaderMap, request: axum::extract::Request, next: Next) -> Response {
    let Some(candidate) = extract_token(&headers) else {
        return ApiError::from(relay_core::EngineError::SidechannelAuth).into_response();
    };
    if !tokens_match(&state.engine.sidechannel_token, &candidate) {
        return ApiError::from(relay_core::EngineError::SidechannelAuth).into_response();
    }
    next.run(request).await
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers.get("x-relay-token").and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty()) {
        return Some(token.to_string());
    }
    let auth = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed.strip_prefix("Bearer ").or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    task_text: String,
    model: Option<String>,
    working_directory: Option<String>,
}

async fn create_task(State(state): State<AppState>, Json(req): Json<CreateTaskRequest>) -> impl IntoResponse {
    let working_directory = req.working_directory.unwrap_or_else(|| state.engine.config.projects_dir.clone());
    let task = submit_task(&state.engine, req.task_text, req.model, working_directory);
    (StatusCode::ACCEPTED, Json(task))
}

async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Json<Task>, ApiError> {
    state.engine.store.get_task(&task_id).map(Json).ok_or_else(|| task_not_found(&task_id).into())
}

#[derive(Deserialize)]
struct AskQuestionRequest {
    task_id: String,
    prompt: String,
    #[serde(default)]
    suggested_answers: Vec<String>,
}

async fn create_question(State(state): State<AppState>, Json(req): Json<AskQuestionRequest>) -> Result<Json<PendingQuestion>, ApiError> {
    let question = ask_question(&state.engine, &req.task_id, req.prompt, req.suggested_answers)?;
    Ok(Json(question))
}

/// Long-polls up to 30 s on the question's completion signal: `204` if
/// still pending, the answer once submitted, `404` if unknown.
async fn get_question_answer(State(state): State<AppState>, Path(question_id): Path<String>) -> Response {
    match await_question_answer(&state.engine, &question_id).await {
        None => StatusCode::NOT_FOUND.into_response(),
        Some(question) if question.is_answered() => Json(json!({"answer": question.answer})).into_response(),
        Some(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Deserialize)]
struct SubmitAnswerRequest {
    answer: String,
}

async fn post_question_answer(
    State(state): State<AppState>,
    Path(question_id): Path<String>,
    Json(req): Json<SubmitAnswerRequest>,
) -> Result<Json<PendingQuestion>, ApiError> {
    let question = submit_question_answer(&state.engine, &question_id, req.answer)?;
    Ok(Json(question))
}

#[derive(Deserialize)]
struct SpawnAgentRequest {
    task_id: String,
    role: String,
    name: String,
    task_text: String,
    model: Option<String>,
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Serialize)]
struct SpawnAgentResponse {
    agent_id: String,
    status: relay_types::AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_tail: Option<Vec<String>>,
}

async fn spawn_agent_route(State(state): State<AppState>, Json(req): Json<SpawnAgentRequest>) -> Result<Json<SpawnAgentResponse>, ApiError> {
    Ok(Json(spawn_and_maybe_wait(&state, req).await?))
}

async fn spawn_and_maybe_wait(state: &AppState, req: SpawnAgentRequest) -> Result<SpawnAgentResponse, ApiError> {
    let wait = req.wait;
    let agent = spawn_agent(
        &state.engine,
        SpawnRequest {
            task_id: req.task_id,
            role: req.role,
            name: req.name,
            task_text: req.task_text,
            model: req.model,
        },
    )
    .await?;

    if !wait {
        return Ok(SpawnAgentResponse { agent_id: agent.id, status: agent.status, output_tail: None });
    }

    let finished = await_one(&state.engine, &agent.id).await?;
    Ok(SpawnAgentResponse {
        agent_id: finished.id,
        status: finished.status,
        output_tail: Some(finished.output_tail(500).to_vec()),
    })
}

async fn spawn_agents_batch(State(state): State<AppState>, Json(reqs): Json<Vec<SpawnAgentRequest>>) -> Json<Vec<serde_json::Value>> {
    let mut results = Vec::with_capacity(reqs.len());
    for req in reqs {
        let task_id = req.task_id.clone();
        let role = req.role.clone();
        let name = req.name.clone();
        let outcome = spawn_agent(
            &state.engine,
            SpawnRequest { task_id, role, name, task_text: req.task_text, model: req.model },
        )
        .await;
        let value = match outcome {
            Ok(agent) => json!({"agent_id": agent.id, "status": agent.status}),
            Err(err) => json!({"error": err.to_string()}),
        };
        results.push(value);
    }
    Json(results)
}

#[derive(Serialize)]
struct AgentSnapshot {
    id: String,
    status: relay_types::AgentStatus,
    output_tail: Vec<String>,
    files_modified: Vec<String>,
    files_read: Vec<String>,
}

impl From<DynamicAgent> for AgentSnapshot {
    fn from(agent: DynamicAgent) -> Self {
        Self {
            id: agent.id.clone(),
            status: agent.status,
            output_tail: agent.output_tail(500).to_vec(),
            files_modified: agent.files_modified,
            files_read: agent.files_read,
        }
    }
}

async fn agent_status(State(state): State<AppState>, Path(agent_id): Path<String>) -> Result<Json<AgentSnapshot>, ApiError> {
    state
        .engine
        .store
        .get_agent(&agent_id)
        .map(|a| Json(a.into()))
        .ok_or_else(|| relay_core::EngineError::NotFound(agent_id).into())
}

async fn agent_result(State(state): State<AppState>, Path(agent_id): Path<String>) -> Result<Json<AgentSnapshot>, ApiError> {
    let agent = await_one(&state.engine, &agent_id).await?;
    Ok(Json(agent.into()))
}

#[derive(Deserialize)]
struct AgentsWaitRequest {
    agent_ids: Vec<String>,
    #[serde(default = "default_wait_timeout_secs")]
    timeout_secs: u64,
}

fn default_wait_timeout_secs() -> u64 {
    AWAIT_MANY_MAX_TIMEOUT.as_secs()
}

async fn agents_wait(State(state): State<AppState>, Json(req): Json<AgentsWaitRequest>) -> Json<Vec<serde_json::Value>> {
    let timeout = Duration::from_secs(req.timeout_secs).min(AWAIT_MANY_MAX_TIMEOUT);
    let results = await_many(&state.engine, &req.agent_ids, timeout).await;
    let values = req
        .agent_ids
        .iter()
        .zip(results)
        .map(|(id, result)| match result {
            Ok(agent) => json!(AgentSnapshot::from(agent)),
            Err(_) => json!({"agent_id": id, "error": "unknown agent"}),
        })
        .collect();
    Json(values)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use relay_core::EngineConfig;
    use relay_orchestrator::Engine;
    use tower::ServiceExt;

    use super::*;

    fn test_app() -> (Router, AppState) {
        let engine = Engine::new(EngineConfig::default());
        let state = AppState::new(engine);
        (router(state.clone()).with_state(state.clone()), state)
    }

    #[tokio::test]
    async fn submit_then_poll_round_trips_a_task() {
        let (app, _state) = test_app();
        let body = Body::from(r#"{"task_text":"scan the repo for secrets"}"#);
        let request = Request::builder().method("POST").uri("/task").header("content-type", "application/json").body(body).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let task: Task = serde_json::from_slice(&bytes).unwrap();

        let request = Request::builder().method("GET").uri(format!("/task/{}", task.id)).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_task_returns_not_found() {
        let (app, _state) = test_app();
        let request = Request::builder().method("GET").uri("/task/does-not-exist").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn internal_routes_reject_missing_token() {
        let (app, _state) = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/internal/question")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"task_id":"task-001","prompt":"continue?"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn internal_routes_accept_the_shared_token() {
        let (app, state) = test_app();
        let task = submit_task(&state.engine, "investigate".to_string(), None, "./projects".to_string());
        let request = Request::builder()
            .method("POST")
            .uri("/internal/question")
            .header("content-type", "application/json")
            .header("x-relay-token", &*state.engine.sidechannel_token)
            .body(Body::from(format!(r#"{{"task_id":"{}","prompt":"continue?"}}"#, task.id)))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
