use std::time::Duration;

use relay_core::{conversation_stream, task_stream, EngineError};
use relay_runtime::stream_parser::{parse_agent_line, ParsedEvent};
use relay_runtime::{AgentInvocation, CHILD_AGENT_TIMEOUT, ORCHESTRATOR_TIMEOUT};
use relay_types::{
    next_agent_id, next_finding_id, next_question_id, AgentStatus, DynamicAgent, EngineEvent, Finding,
    FindingStatus, PendingQuestion,
};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::engine::Engine;

/// Long-poll budget for a single `await_one` call.
pub const AWAIT_ONE_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound a caller may request for `await_many`.
pub const AWAIT_MANY_MAX_TIMEOUT: Duration = Duration::from_secs(900);

/// Parameters for spawning one dynamic agent under a task.
pub struct SpawnRequest {
    pub task_id: String,
    pub role: String,
    pub name: String,
    pub task_text: String,
    pub model: Option<String>,
}

/// Completion notifications keyed by id, so `await_one`/`await_many`
/// (agent ids, carrying `bool`) and the question long-poll (question
/// ids, carrying `Option<PendingQuestion>` so the answered snapshot
/// rides the signal itself) can block on a cheap channel instead of
/// polling the store.
pub struct CompletionSignals<T> {
    inner: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<String, watch::Sender<T>>>>,
}

impl<T> Clone for CompletionSignals<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Default for CompletionSignals<T> {
    fn default() -> Self {
        Self { inner: std::sync::Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())) }
    }
}

impl<T: Clone> CompletionSignals<T> {
    /// Registers `id` against `initial` and returns the sender half.
    /// The sender is also kept internally so a later call site (one
    /// that didn't do the registering) can still fire it through `signal`.
    fn register(&self, id: &str, initial: T) -> watch::Sender<T> {
        let (tx, _rx) = watch::channel(initial);
        self.inner
            .lock()
            .expect("completion signal map poisoned")
            .insert(id.to_string(), tx.clone());
        tx
    }

    fn receiver_for(&self, id: &str) -> Option<watch::Receiver<T>> {
        self.inner.lock().expect("completion signal map poisoned").get(id).map(|tx| tx.subscribe())
    }

    /// Fires the signal for an already-registered id, if any. A no-op
    /// for unknown ids rather than an error -- the caller (e.g. a
    /// REST-fallback answer submission racing a long-poll timeout) has
    /// no obligation that anyone is still listening.
    fn signal(&self, id: &str, value: T) {
        if let Some(tx) = self.inner.lock().expect("completion signal map poisoned").get(id) {
            let _ = tx.send(value);
        }
    }
}

/// Spawns a dynamic agent under `request.task_id` and launches its
/// subprocess in the background. Returns the agent's initial (pending)
/// record immediately; callers observe progress through the task's
/// event stream or by polling `get_agent_status`/`await_one`.
pub async fn spawn_agent(engine: &Engine, request: SpawnRequest) -> Result<DynamicAgent, EngineError> {
    let task = engine
        .store
        .get_task(&request.task_id)
        .ok_or_else(|| EngineError::NotFound(request.task_id.clone()))?;

    let role_record = engine.roles.lookup(&request.role);
    let agent_id = next_agent_id();
    let agent = DynamicAgent::new(
        agent_id.clone(),
        request.task_id.clone(),
        request.role.clone(),
        request.name.clone(),
        request.task_text.clone(),
        role_record.color.clone(),
        role_record.icon.clone(),
    );
    engine.store.insert_agent(agent.clone())?;

    let completion_tx = engine.completions.register(&agent_id, false);

    publish_event(
        engine,
        &task.id,
        EngineEvent::new(
            "agent-spawn",
            json!({
                "agent_id": agent.id,
                "task_id": task.id,
                "role": agent.role,
                "name": agent.name,
                "color": agent.color,
                "icon": agent.icon,
            }),
        ),
    );

    let model = request.model.unwrap_or_else(|| task.model.clone());
    let invocation = AgentInvocation {
        agent_binary: engine.config.agent_binary.clone(),
        model,
        prompt: build_agent_prompt(&role_record.prompt_prelude, &request.task_text),
        working_directory: task.working_directory.clone().into(),
        sidechannel_binary: engine.config.sidechannel_binary.clone(),
        api_base_url: engine.config.bind_addr_url(),
        task_id: task.id.clone(),
        token: engine.sidechannel_token.to_string(),
        mode: task.execution_mode.unwrap_or(relay_types::ExecutionMode::Native),
        container_image: engine.config.container_image.clone(),
        timeout: CHILD_AGENT_TIMEOUT,
        is_orchestrator: false,
    };

    let cancellation = engine.cancellations.register(&agent_id);
    let engine = engine.clone();
    tokio::spawn(async move {
        run_agent_to_completion(engine, agent_id, invocation, cancellation, completion_tx).await;
    });

    Ok(agent)
}

fn build_agent_prompt(prelude: &str, task_text: &str) -> String {
    format!("{prelude}\n\nTask:\n{task_text}")
}

async fn run_agent_to_completion(
    engine: Engine,
    agent_id: String,
    invocation: AgentInvocation,
    cancellation: tokio_util::sync::CancellationToken,
    completion_tx: watch::Sender<bool>,
) {
    let task_id = invocation.task_id.clone();

    let outcome = relay_runtime::run_invocation(invocation, cancellation, |line| {
        apply_agent_line(&engine, &task_id, &agent_id, line);
    })
    .await;

    let final_status = match &outcome {
        Ok(o) if o.exit_code == Some(0) && !o.timed_out => AgentStatus::Completed,
        _ => AgentStatus::Failed,
    };

    if let Err(err) = &outcome {
        warn!(%agent_id, %task_id, error = %err, "agent invocation errored");
    }

    let updated = engine.store.update_agent(&agent_id, |a| {
        a.status = final_status;
        a.completed_at = Some(chrono::Utc::now());
    });

    if let Ok(agent) = updated {
        publish_event(
            &engine,
            &task_id,
            EngineEvent::new("agent-complete", json!({"agent_id": agent.id, "status": agent.status})),
        );
    }

    engine.cancellations.remove(&agent_id);
    let _ = completion_tx.send(true);
}

/// Parses one stdout line from an agent subprocess and applies its
/// effects: appends to the agent's output, records file activity,
/// stores findings, and mirrors everything onto the task's event stream.
fn apply_agent_line(engine: &Engine, task_id: &str, agent_id: &str, line: &str) {
    for event in parse_agent_line(line) {
        match event {
            ParsedEvent::Output(text) => {
                let _ = engine.store.update_agent(agent_id, |a| a.output_lines.push(text.clone()));
                publish_event(engine, task_id, EngineEvent::new("agent-output", json!({"agent_id": agent_id, "line": text})));
            }
            ParsedEvent::FileActivity { action, path } => {
                let _ = engine.store.update_agent(agent_id, |a| a.record_file(action, path.clone()));
                publish_event(
                    engine,
                    task_id,
                    EngineEvent::new("file-activity", json!({"agent_id": agent_id, "action": action, "path": path})),
                );
            }
            ParsedEvent::Finding(draft) => {
                let agent = engine.store.get_agent(agent_id);
                let finding = Finding {
                    id: next_finding_id(),
                    task_id: task_id.to_string(),
                    severity: draft.severity,
                    finding_type: draft.finding_type,
                    title: draft.title,
                    description: draft.description,
                    file: None,
                    line: None,
                    remediation: None,
                    reporting_role: agent.map(|a| a.role).unwrap_or_default(),
                    status: FindingStatus::Open,
                };
                let _ = engine.store.update_task(task_id, |t| t.finding_ids.push(finding.id.clone()));
                publish_event(engine, task_id, EngineEvent::new("finding", serde_json::to_value(&finding).unwrap_or_default()));
                engine.store.insert_finding(finding);
            }
            ParsedEvent::Orchestration(text) => {
                publish_event(engine, task_id, EngineEvent::new("orchestration", json!({"agent_id": agent_id, "line": text})));
            }
        }
    }
}

/// Blocks up to `AWAIT_ONE_TIMEOUT` for `agent_id` to reach a terminal
/// state, returning its current record either way.
pub async fn await_one(engine: &Engine, agent_id: &str) -> Result<DynamicAgent, EngineError> {
    let agent = engine.store.get_agent(agent_id).ok_or_else(|| EngineError::NotFound(agent_id.to_string()))?;
    if agent.is_terminal() {
        return Ok(agent);
    }
    if let Some(mut rx) = engine.completions.receiver_for(agent_id) {
        let _ = timeout(AWAIT_ONE_TIMEOUT, async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }
    engine.store.get_agent(agent_id).ok_or_else(|| EngineError::NotFound(agent_id.to_string()))
}

/// Waits on every id in `agent_ids`, preserving input order in the
/// result, capped at `requested_timeout` (itself capped at
/// `AWAIT_MANY_MAX_TIMEOUT`).
pub async fn await_many(
    engine: &Engine,
    agent_ids: &[String],
    requested_timeout: Duration,
) -> Vec<Result<DynamicAgent, EngineError>> {
    let bound = requested_timeout.min(AWAIT_MANY_MAX_TIMEOUT);
    let waits = agent_ids.iter().map(|id| async move {
        let agent = match engine.store.get_agent(id) {
            Some(a) => a,
            None => return Err(EngineError::NotFound(id.clone())),
        };
        if agent.is_terminal() {
            return Ok(agent);
        }
        if let Some(mut rx) = engine.completions.receiver_for(id) {
            let _ = timeout(bound, async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
        engine.store.get_agent(id).ok_or_else(|| EngineError::NotFound(id.clone()))
    });
    futures::future::join_all(waits).await
}

/// Publishes an event to a task's own stream and, if some console
/// conversation currently has this task active, that conversation's
/// stream too -- the mechanism behind `/ws/console`'s frame subset.
pub fn publish_event(engine: &Engine, task_id: &str, event: EngineEvent) {
    engine.events.publish(&task_stream(task_id), event.clone());
    if let Some(cid) = engine.conversations.conversation_for_task(task_id) {
        engine.events.publish(&conversation_stream(&cid), event);
    }
}

/// Creates a PendingQuestion under `task_id`, enforcing the global
/// unanswered-question cap, and broadcasts a `clarification` frame.
pub fn ask_question(
    engine: &Engine,
    task_id: &str,
    prompt: String,
    suggested_answers: Vec<String>,
) -> Result<PendingQuestion, EngineError> {
    engine.store.get_task(task_id).ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
    let question = PendingQuestion::new(next_question_id(), task_id, prompt, suggested_answers);
    engine.store.insert_question(question.clone())?;
    let _ = engine.question_signals.register(&question.id, None);
    publish_event(
        engine,
        task_id,
        EngineEvent::new(
            "clarification",
            json!({
                "question_id": question.id,
                "task_id": task_id,
                "prompt": question.prompt,
                "suggested_answers": question.suggested_answers,
            }),
        ),
    );
    Ok(question)
}

/// Submits the answer to a still-open question: sets it, signals any
/// `await_question_answer` long-poll waiting on it (carrying the
/// answered snapshot through the signal itself, since the table entry
/// is removed immediately after), and drops the table entry. A second
/// submission against the same id therefore sees it as unknown.
pub fn submit_question_answer(engine: &Engine, question_id: &str, answer: String) -> Result<PendingQuestion, EngineError> {
    let question = engine.store.answer_question(question_id, answer)?;
    engine.store.remove_question(question_id);
    engine.question_signals.signal(question_id, Some(question.clone()));
    Ok(question)
}

/// Long-polls up to `AWAIT_ONE_TIMEOUT` for `question_id` to be
/// answered. Returns the answered snapshot once submitted, or the
/// current still-pending snapshot on timeout; `None` if the question is
/// unknown (never existed, or already consumed by an earlier answer).
pub async fn await_question_answer(engine: &Engine, question_id: &str) -> Option<PendingQuestion> {
    match engine.store.get_question(question_id) {
        Some(question) if question.is_answered() => return Some(question),
        None => return None,
        _ => {}
    }
    let Some(mut rx) = engine.question_signals.receiver_for(question_id) else {
        return engine.store.get_question(question_id);
    };
    let answered = timeout(AWAIT_ONE_TIMEOUT, async {
        loop {
            if let Some(question) = rx.borrow().clone() {
                return question;
            }
            let _ = rx.changed().await;
        }
    })
    .await;
    match answered {
        Ok(question) => Some(question),
        Err(_) => engine.store.get_question(question_id),
    }
}

/// The orchestrator's own invocation uses the longer wall-clock budget
/// and the full sidechannel tool surface.
pub fn orchestrator_invocation(engine: &Engine, task_id: &str, prompt: String, working_directory: std::path::PathBuf, mode: relay_types::ExecutionMode) -> AgentInvocation {
    AgentInvocation {
        agent_binary: engine.config.agent_binary.clone(),
        model: engine.config.default_model.clone(),
        prompt,
        working_directory,
        sidechannel_binary: engine.config.sidechannel_binary.clone(),
        api_base_url: engine.config.bind_addr_url(),
        task_id: task_id.to_string(),
        token: engine.sidechannel_token.to_string(),
        mode,
        container_image: engine.config.container_image.clone(),
        timeout: ORCHESTRATOR_TIMEOUT,
        is_orchestrator: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::EngineConfig;
    use relay_types::Task;

    fn sample_engine() -> Engine {
        Engine::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn spawning_an_agent_registers_it_under_its_task() {
        let engine = sample_engine();
        engine.store.insert_task(Task::new("task-001".into(), "build it", "default", "/work/task-001"));
        let agent = spawn_agent(
            &engine,
            SpawnRequest {
                task_id: "task-001".into(),
                role: "tester".into(),
                name: "Tester".into(),
                task_text: "run the suite".into(),
                model: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(agent.status, AgentStatus::Pending);
        assert_eq!(engine.store.agent_count_for_task("task-001"), 1);
    }

    #[tokio::test]
    async fn spawning_against_unknown_task_is_rejected() {
        let engine = sample_engine();
        let result = spawn_agent(
            &engine,
            SpawnRequest {
                task_id: "missing".into(),
                role: "tester".into(),
                name: "Tester".into(),
                task_text: "run the suite".into(),
                model: None,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn await_one_returns_immediately_for_terminal_agent() {
        let engine = sample_engine();
        engine.store.insert_task(Task::new("task-001".into(), "build it", "default", "/work/task-001"));
        engine.store.insert_agent(DynamicAgent::new("agent-001".into(), "task-001", "tester", "Tester", "run", "#22c55e", "FlaskConical")).unwrap();
        engine.store.update_agent("agent-001", |a| a.status = AgentStatus::Completed).unwrap();
        let agent = await_one(&engine, "agent-001").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Completed);
    }

    #[tokio::test]
    async fn question_round_trip_consumes_on_answer() {
        let engine = sample_engine();
        engine.store.insert_task(Task::new("task-001".into(), "build it", "default", "/work/task-001"));
        let question = ask_question(&engine, "task-001", "which db?".into(), vec!["postgres".into()]).unwrap();

        let engine_for_wait = engine.clone();
        let question_id = question.id.clone();
        let waiter = tokio::spawn(async move { await_question_answer(&engine_for_wait, &question_id).await });

        tokio::task::yield_now().await;
        let answered = submit_question_answer(&engine, &question.id, "postgres".into()).unwrap();
        assert_eq!(answered.answer.as_deref(), Some("postgres"));

        let observed = waiter.await.unwrap().unwrap();
        assert_eq!(observed.answer.as_deref(), Some("postgres"));

        assert!(submit_question_answer(&engine, &question.id, "sqlite".into()).is_err());
    }
}
