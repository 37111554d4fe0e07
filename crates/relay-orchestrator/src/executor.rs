use relay_core::EngineError;
use relay_runtime::detect_sandbox;
use relay_types::{EngineEvent, ExecutionMode, Task, TaskStatus};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::fallback::run_fallback_pipeline;
use crate::scheduler;

/// Submits a new task: inserts it in `queued` state and spawns its
/// execution in the background. Returns the task's initial record
/// immediately; admission into the concurrency gate (and everything
/// after) happens off the calling task.
pub fn submit_task(engine: &Engine, task_text: String, model: Option<String>, working_directory: String) -> Task {
    let task = Task::new(
        relay_types::next_task_id(),
        task_text,
        model.unwrap_or_else(|| engine.config.default_model.clone()),
        working_directory,
    );
    engine.store.insert_task(task.clone());

    let engine = engine.clone();
    let task_id = task.id.clone();
    tokio::spawn(async move { run_task(engine, task_id).await });

    task
}

async fn run_task(engine: Engine, task_id: String) {
    let _permit = match engine.admission.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let sandbox = detect_sandbox(engine.config.allow_host).await;
    if sandbox.mode == ExecutionMode::Blocked {
        warn!(%task_id, reason = %sandbox.reason, "task rejected: sandbox admission denied");
        let _ = engine.store.update_task(&task_id, |t| {
            t.status = TaskStatus::Failed;
            t.execution_mode = Some(sandbox.mode);
            t.completed_at = Some(chrono::Utc::now());
        });
        scheduler::publish_event(
            &engine,
            &task_id,
            EngineEvent::new(
                "complete",
                json!({"task_id": task_id, "status": "failed", "reason": sandbox.reason}),
            ),
        );
        return;
    }

    let task = match engine.store.update_task(&task_id, |t| {
        t.status = TaskStatus::Running;
        t.execution_mode = Some(sandbox.mode);
        t.started_at = Some(chrono::Utc::now());
    }) {
        Ok(()) => match engine.store.get_task(&task_id) {
            Some(t) => t,
            None => return,
        },
        Err(_) => return,
    };

    let invocation = scheduler::orchestrator_invocation(
        &engine,
        &task_id,
        task.task_text.clone(),
        task.working_directory.clone().into(),
        sandbox.mode,
    );

    let engine_for_lines = engine.clone();
    let task_id_for_lines = task_id.clone();
    let outcome = relay_runtime::run_invocation(invocation, CancellationToken::new(), move |line| {
        apply_orchestrator_line(&engine_for_lines, &task_id_for_lines, line);
    })
    .await;

    let orchestrator_succeeded = matches!(&outcome, Ok(o) if o.exit_code == Some(0) && !o.timed_out);
    if let Err(err) = &outcome {
        warn!(%task_id, error = %err, "orchestrator invocation errored");
    }

    if engine.store.agent_count_for_task(&task_id) == 0 {
        info!(%task_id, "no dynamic agents were spawned, falling back to the static pipeline");
        run_fallback_pipeline(&engine, &task_id).await;
        return;
    }

    let final_status = if orchestrator_succeeded { TaskStatus::Completed } else { TaskStatus::Failed };
    let _ = engine.store.update_task(&task_id, |t| {
        t.status = final_status;
        t.completed_at = Some(chrono::Utc::now());
    });
    scheduler::publish_event(
        &engine,
        &task_id,
        EngineEvent::new("complete", json!({"task_id": task_id, "status": final_status})),
    );
}

fn apply_orchestrator_line(engine: &Engine, task_id: &str, line: &str) {
    for event in relay_runtime::parse_agent_line(line) {
        if let relay_runtime::ParsedEvent::Output(text) = event {
            scheduler::publish_event(engine, task_id, EngineEvent::new("output", json!({"task_id": task_id, "line": text})));
        }
    }
}

/// Returns the `EngineError` for a client request against a task that
/// doesn't exist, centralizing the message format used across routes.
pub fn task_not_found(task_id: &str) -> EngineError {
    EngineError::NotFound(task_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::EngineConfig;

    #[test]
    fn submit_task_registers_it_as_queued_then_hands_off() {
        let engine = Engine::new(EngineConfig::default());
        let task = submit_task(&engine, "do the thing".into(), None, "/work/task-001".into());
        assert_eq!(task.task_text, "do the thing");
        assert!(engine.store.get_task(&task.id).is_some());
    }
}
