use std::collections::HashMap;
use std::sync::Mutex;

use relay_types::{DynamicAgent, Finding, PendingQuestion, Screenshot, Task};

use crate::error::EngineError;

/// Maximum dynamic agents a single task may have spawned over its
/// lifetime (completed agents still count against the cap).
pub const MAX_AGENTS_PER_TASK: usize = 100;
/// Maximum pending questions outstanding across the whole engine at once.
pub const MAX_PENDING_QUESTIONS: usize = 100;

/// The engine's entire in-memory state: every task, its agents,
/// findings, screenshots, and any question currently blocking one of
/// its agents. There is deliberately no persistence layer behind this
/// -- a restart starts from empty tables.
pub struct EngineStore {
    tasks: Mutex<HashMap<String, Task>>,
    agents: Mutex<HashMap<String, DynamicAgent>>,
    task_agent_ids: Mutex<HashMap<String, Vec<String>>>,
    findings: Mutex<HashMap<String, Finding>>,
    screenshots: Mutex<HashMap<String, Screenshot>>,
    questions: Mutex<HashMap<String, PendingQuestion>>,
}

impl EngineStore {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            task_agent_ids: Mutex::new(HashMap::new()),
            findings: Mutex::new(HashMap::new()),
            screenshots: Mutex::new(HashMap::new()),
            questions: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().expect("task table lock poisoned")
    }

    fn agents(&self) -> std::sync::MutexGuard<'_, HashMap<String, DynamicAgent>> {
        self.agents.lock().expect("agent table lock poisoned")
    }

    fn task_agent_ids(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.task_agent_ids.lock().expect("task agent index lock poisoned")
    }

    pub fn insert_task(&self, task: Task) {
        self.tasks().insert(task.id.clone(), task);
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks().get(task_id).cloned()
    }

    pub fn update_task(&self, task_id: &str, f: impl FnOnce(&mut Task)) -> Result<(), EngineError> {
        let mut tasks = self.tasks();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
        f(task);
        Ok(())
    }

    /// Agent ids belonging to a task, in spawn order.
    pub fn agent_ids_for_task(&self, task_id: &str) -> Vec<String> {
        self.task_agent_ids().get(task_id).cloned().unwrap_or_default()
    }

    pub fn agent_count_for_task(&self, task_id: &str) -> usize {
        self.task_agent_ids().get(task_id).map(Vec::len).unwrap_or(0)
    }

    /// Registers a freshly spawned agent, enforcing the per-task cap.
    pub fn insert_agent(&self, agent: DynamicAgent) -> Result<(), EngineError> {
        let mut index = self.task_agent_ids();
        let ids = index.entry(agent.task_id.clone()).or_default();
        if ids.len() >= MAX_AGENTS_PER_TASK {
            return Err(EngineError::ClientResourceLimit(format!(
                "task {} already has {} agents",
                agent.task_id, MAX_AGENTS_PER_TASK
            )));
        }
        ids.push(agent.id.clone());
        if let Some(task) = self.tasks().get_mut(&agent.task_id) {
            task.agent_ids.push(agent.id.clone());
        }
        self.agents().insert(agent.id.clone(), agent);
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<DynamicAgent> {
        self.agents().get(agent_id).cloned()
    }

    pub fn update_agent(&self, agent_id: &str, f: impl FnOnce(&mut DynamicAgent)) -> Result<DynamicAgent, EngineError> {
        let mut agents = self.agents();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::NotFound(agent_id.to_string()))?;
        f(agent);
        Ok(agent.clone())
    }

    pub fn insert_finding(&self, finding: Finding) {
        self.findings.lock().expect("finding table lock poisoned").insert(finding.id.clone(), finding);
    }

    pub fn findings_for_task(&self, task_id: &str) -> Vec<Finding> {
        self.findings
            .lock()
            .expect("finding table lock poisoned")
            .values()
            .filter(|f| f.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn insert_screenshot(&self, screenshot: Screenshot) {
        self.screenshots
            .lock()
            .expect("screenshot table lock poisoned")
            .insert(screenshot.id.clone(), screenshot);
    }

    pub fn screenshots_for_task(&self, task_id: &str) -> Vec<Screenshot> {
        self.screenshots
            .lock()
            .expect("screenshot table lock poisoned")
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn insert_question(&self, question: PendingQuestion) -> Result<(), EngineError> {
        let mut questions = self.questions.lock().expect("question table lock poisoned");
        let outstanding = questions.values().filter(|q| !q.is_answered()).count();
        if outstanding >= MAX_PENDING_QUESTIONS {
            return Err(EngineError::ClientResourceLimit(format!(
                "already {MAX_PENDING_QUESTIONS} unanswered questions"
            )));
        }
        questions.insert(question.id.clone(), question);
        Ok(())
    }

    pub fn get_question(&self, question_id: &str) -> Option<PendingQuestion> {
        self.questions.lock().expect("question table lock poisoned").get(question_id).cloned()
    }

    pub fn answer_question(&self, question_id: &str, answer: String) -> Result<PendingQuestion, EngineError> {
        let mut questions = self.questions.lock().expect("question table lock poisoned");
        let question = questions
            .get_mut(question_id)
            .ok_or_else(|| EngineError::NotFound(question_id.to_string()))?;
        question.answer = Some(answer);
        question.answered_at = Some(chrono::Utc::now());
        Ok(question.clone())
    }

    /// Drops a question from the table, returning it if it was present.
    /// Used once a submitted answer has been handed off through the
    /// completion signal -- the table keeps no record of answered
    /// questions.
    pub fn remove_question(&self, question_id: &str) -> Option<PendingQuestion> {
        self.questions.lock().expect("question table lock poisoned").remove(question_id)
    }

    pub fn unanswered_questions_for_task(&self, task_id: &str) -> Vec<PendingQuestion> {
        self.questions
            .lock()
            .expect("question table lock poisoned")
            .values()
            .filter(|q| q.task_id == task_id && !q.is_answered())
            .cloned()
            .collect()
    }
}

impl Default for EngineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::AgentStatus;

    fn sample_agent(task_id: &str, id: &str) -> DynamicAgent {
        DynamicAgent::new(id.to_string(), task_id, "tester", "Tester", "run the suite", "#22c55e", "FlaskConical")
    }

    #[test]
    fn agent_cap_is_enforced_per_task() {
        let store = EngineStore::new();
        for i in 0..MAX_AGENTS_PER_TASK {
            store.insert_agent(sample_agent("task-001", &format!("agent-{i:03}"))).unwrap();
        }
        let result = store.insert_agent(sample_agent("task-001", "agent-100"));
        assert!(result.is_err());
    }

    #[test]
    fn insert_agent_appends_to_the_owning_task() {
        let store = EngineStore::new();
        store.insert_task(Task::new("task-001".into(), "do it", "default", "/work/task-001"));
        store.insert_agent(sample_agent("task-001", "agent-a")).unwrap();
        let task = store.get_task("task-001").unwrap();
        assert_eq!(task.agent_ids, vec!["agent-a".to_string()]);
    }

    #[test]
    fn agent_cap_is_independent_per_task() {
        let store = EngineStore::new();
        store.insert_agent(sample_agent("task-001", "agent-a")).unwrap();
        store.insert_agent(sample_agent("task-002", "agent-b")).unwrap();
        assert_eq!(store.agent_count_for_task("task-001"), 1);
        assert_eq!(store.agent_count_for_task("task-002"), 1);
    }

    #[test]
    fn update_agent_mutates_in_place() {
        let store = EngineStore::new();
        store.insert_agent(sample_agent("task-001", "agent-a")).unwrap();
        let updated = store.update_agent("agent-a", |a| a.status = AgentStatus::Completed).unwrap();
        assert_eq!(updated.status, AgentStatus::Completed);
    }

    #[test]
    fn update_unknown_agent_errors() {
        let store = EngineStore::new();
        assert!(store.update_agent("missing", |_| {}).is_err());
    }

    #[test]
    fn question_cap_counts_only_unanswered() {
        let store = EngineStore::new();
        for i in 0..MAX_PENDING_QUESTIONS {
            store
                .insert_question(PendingQuestion::new(format!("question-{i:03}"), "task-001", "ok?", vec![]))
                .unwrap();
        }
        assert!(store.insert_question(PendingQuestion::new("question-100".into(), "task-001", "ok?", vec![])).is_err());
        store.answer_question("question-000", "yes".into()).unwrap();
        assert!(store.insert_question(PendingQuestion::new("question-101".into(), "task-001", "ok?", vec![])).is_ok());
    }
}
