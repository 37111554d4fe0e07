use std::sync::atomic::{AtomicU64, Ordering};

static TASK_COUNTER: AtomicU64 = AtomicU64::new(0);
static AGENT_COUNTER: AtomicU64 = AtomicU64::new(0);
static QUESTION_COUNTER: AtomicU64 = AtomicU64::new(0);
static CONVERSATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static SCREENSHOT_COUNTER: AtomicU64 = AtomicU64::new(0);
static FINDING_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next(counter: &AtomicU64, prefix: &str) -> String {
    let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{prefix}-{n:03}")
}

/// Monotonic `task-NNN` id, unique for the lifetime of the process.
pub fn next_task_id() -> String {
    next(&TASK_COUNTER, "task")
}

/// Monotonic `agent-NNN` id, unique for the lifetime of the process.
pub fn next_agent_id() -> String {
    next(&AGENT_COUNTER, "agent")
}

/// Monotonic `question-NNN` id, unique for the lifetime of the process.
pub fn next_question_id() -> String {
    next(&QUESTION_COUNTER, "question")
}

/// Monotonic `conv-NNN` id, unique for the lifetime of the process.
pub fn next_conversation_id() -> String {
    next(&CONVERSATION_COUNTER, "conv")
}

/// Monotonic `shot-NNN` id, unique for the lifetime of the process.
pub fn next_screenshot_id() -> String {
    next(&SCREENSHOT_COUNTER, "shot")
}

/// Monotonic `finding-NNN` id, unique for the lifetime of the process.
pub fn next_finding_id() -> String {
    next(&FINDING_COUNTER, "finding")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_prefixed() {
        let a = next_task_id();
        let b = next_task_id();
        assert!(a.starts_with("task-"));
        assert!(b.starts_with("task-"));
        assert_ne!(a, b);
    }

    #[test]
    fn counters_are_independent_per_kind() {
        let task = next_task_id();
        let agent = next_agent_id();
        assert!(task.starts_with("task-"));
        assert!(agent.starts_with("agent-"));
    }
}
