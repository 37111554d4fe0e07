use relay_types::{EngineEvent, Phase, PhaseStatus, Screenshot, TaskStatus};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::scheduler;

/// The static fallback pipeline: a fixed wave DAG run when an
/// orchestrator invocation completes without spawning any dynamic
/// agents of its own. Each wave's phases run concurrently; the next
/// wave only starts once every phase in the current one has settled.
///
/// `plan -> {develop, develop-2} -> {test, security} -> report`
const WAVES: &[&[(&str, &str)]] = &[
    &[("plan", "developer")],
    &[("develop", "developer"), ("develop-2", "developer-2")],
    &[("test", "tester"), ("security", "security-reviewer")],
    &[("report", "report")],
];

/// Runs the fixed wave pipeline for `task_id`, updating the task's
/// `pipeline` field as each phase starts and finishes. Returns once the
/// last wave has settled; the task is `completed` unless any phase
/// failed, in which case it is `failed`.
pub async fn run_fallback_pipeline(engine: &Engine, task_id: &str) {
    info!(%task_id, "static fallback pipeline starting: orchestrator spawned no dynamic agents");

    let mut phases = Vec::new();
    for (group_index, wave) in WAVES.iter().enumerate() {
        for (name, role) in *wave {
            phases.push(Phase::new(*name, group_index as u32, *role));
        }
    }
    let _ = engine.store.update_task(task_id, |t| t.pipeline = phases);

    let mut pipeline_failed = false;

    for (group_index, wave) in WAVES.iter().enumerate() {
        let mut handles = Vec::new();
        for (name, role) in *wave {
            let _ = engine.store.update_task(task_id, |t| {
                if let Some(phase) = t.pipeline.iter_mut().find(|p| p.name == *name) {
                    phase.status = PhaseStatus::Running;
                    phase.started_at = Some(chrono::Utc::now());
                }
            });
            scheduler::publish_event(
                engine,
                task_id,
                EngineEvent::new("phase", json!({"task_id": task_id, "phase": name, "status": "running"})),
            );

            let engine = engine.clone();
            let task_id = task_id.to_string();
            let name = name.to_string();
            let role = role.to_string();
            handles.push(tokio::spawn(async move { run_phase(&engine, &task_id, &name, &role).await }));
        }

        for handle in handles {
            match handle.await {
                Ok(true) => {}
                _ => pipeline_failed = true,
            }
        }

        info!(%task_id, wave = group_index, failed = pipeline_failed, "fallback pipeline wave settled");
        capture_screenshot(engine, task_id, wave.last().map(|(name, _)| name.to_string()));
    }

    let final_status = if pipeline_failed { TaskStatus::Failed } else { TaskStatus::Completed };
    let _ = engine.store.update_task(task_id, |t| {
        t.status = final_status;
        t.completed_at = Some(chrono::Utc::now());
    });
    scheduler::publish_event(
        engine,
        task_id,
        EngineEvent::new("complete", json!({"task_id": task_id, "status": final_status})),
    );
}

/// Runs one phase's invocation to completion and records its outcome.
/// Returns `true` on success.
async fn run_phase(engine: &Engine, task_id: &str, name: &str, role: &str) -> bool {
    let task = match engine.store.get_task(task_id) {
        Some(t) => t,
        None => return false,
    };
    let role_record = engine.roles.lookup(role);
    let invocation = scheduler::orchestrator_invocation(
        engine,
        task_id,
        format!("{}\n\nPhase: {name}\nTask:\n{}", role_record.prompt_prelude, task.task_text),
        task.working_directory.clone().into(),
        task.execution_mode.unwrap_or(relay_types::ExecutionMode::Native),
    );

    let engine_for_lines = engine.clone();
    let task_id_owned = task_id.to_string();
    let name_owned = name.to_string();
    let outcome = relay_runtime::run_invocation(invocation, CancellationToken::new(), move |line| {
        let _ = engine_for_lines.store.update_task(&task_id_owned, |t| {
            if let Some(phase) = t.pipeline.iter_mut().find(|p| p.name == name_owned) {
                phase.output_lines.push(line.to_string());
            }
        });
    })
    .await;

    let succeeded = matches!(&outcome, Ok(o) if o.exit_code == Some(0) && !o.timed_out);
    let status = if succeeded { PhaseStatus::Completed } else { PhaseStatus::Failed };
    let _ = engine.store.update_task(task_id, |t| {
        if let Some(phase) = t.pipeline.iter_mut().find(|p| p.name == name) {
            phase.status = status;
            phase.completed_at = Some(chrono::Utc::now());
        }
    });
    scheduler::publish_event(
        engine,
        task_id,
        EngineEvent::new("phase", json!({"task_id": task_id, "phase": name, "status": status})),
    );
    succeeded
}

/// Captures the task's last 20 output lines across every phase run so
/// far as a terminal snapshot, stores it, and broadcasts a `screenshot`
/// frame. Called once per wave boundary, per the fixed pipeline's
/// between-waves checkpoint.
fn capture_screenshot(engine: &Engine, task_id: &str, phase_name: Option<String>) {
    let recent_lines = engine
        .store
        .get_task(task_id)
        .map(|t| {
            let mut lines: Vec<String> = t.pipeline.iter().flat_map(|p| p.output_lines.iter().cloned()).collect();
            let start = lines.len().saturating_sub(20);
            lines.split_off(start)
        })
        .unwrap_or_default();

    let id = relay_types::next_screenshot_id();
    let screenshot = Screenshot::new(id.clone(), task_id, phase_name, format!("{task_id}/.relay/screenshots/{id}.png"))
        .with_caption(recent_lines.join("\n"));
    scheduler::publish_event(
        engine,
        task_id,
        EngineEvent::new(
            "screenshot",
            json!({"screenshot_id": screenshot.id, "task_id": task_id, "lines": recent_lines}),
        ),
    );
    engine.store.insert_screenshot(screenshot);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waves_cover_every_fixed_phase_once() {
        let names: Vec<&str> = WAVES.iter().flat_map(|w| w.iter().map(|(n, _)| *n)).collect();
        assert_eq!(names, vec!["plan", "develop", "develop-2", "test", "security", "report"]);
    }
}
