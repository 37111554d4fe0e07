use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of sandbox admission (see the sandbox policy in `relay-runtime`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Native,
    HostOverride,
    ContainerWrap,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One step of the static fallback pipeline's wave DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    /// Which parallel wave this phase belongs to (0 = plan, 1 = develop/develop-2, ...).
    pub group_index: u32,
    pub status: PhaseStatus,
    pub assigned_role: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_lines: Vec<String>,
}

impl Phase {
    pub fn new(name: impl Into<String>, group_index: u32, assigned_role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_index,
            status: PhaseStatus::Pending,
            assigned_role: assigned_role.into(),
            started_at: None,
            completed_at: None,
            output_lines: Vec::new(),
        }
    }
}

/// A user-submitted work item: one orchestrator agent and zero or more
/// child agents spawned at runtime to satisfy it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_text: String,
    pub model: String,
    pub working_directory: String,
    pub status: TaskStatus,
    pub execution_mode: Option<ExecutionMode>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Only populated when the static fallback pipeline runs.
    pub pipeline: Vec<Phase>,
    pub agent_ids: Vec<String>,
    pub finding_ids: Vec<String>,
}

impl Task {
    pub fn new(id: String, task_text: impl Into<String>, model: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            id,
            task_text: task_text.into(),
            model: model.into(),
            working_directory: working_directory.into(),
            status: TaskStatus::Queued,
            execution_mode: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            pipeline: Vec::new(),
            agent_ids: Vec::new(),
            finding_ids: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A single running or finished agent subprocess, tracked inside its
/// parent task's dynamic agent table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicAgent {
    pub id: String,
    pub task_id: String,
    pub role: String,
    pub name: String,
    pub task_text: String,
    pub status: AgentStatus,
    pub color: String,
    pub icon: String,
    pub output_lines: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_read: Vec<String>,
    pub spawned_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DynamicAgent {
    pub fn new(
        id: String,
        task_id: impl Into<String>,
        role: impl Into<String>,
        name: impl Into<String>,
        task_text: impl Into<String>,
        color: impl Into<String>,
        icon: impl Into<String>,
    ) -> Self {
        Self {
            id,
            task_id: task_id.into(),
            role: role.into(),
            name: name.into(),
            task_text: task_text.into(),
            status: AgentStatus::Pending,
            color: color.into(),
            icon: icon.into(),
            output_lines: Vec::new(),
            files_modified: Vec::new(),
            files_read: Vec::new(),
            spawned_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AgentStatus::Completed | AgentStatus::Failed)
    }

    /// Appends a path to the appropriate file list, skipping duplicates.
    pub fn record_file(&mut self, action: FileAction, path: impl Into<String>) {
        let path = path.into();
        let list = match action {
            FileAction::Read => &mut self.files_read,
            FileAction::Edit | FileAction::Create => &mut self.files_modified,
        };
        if !list.contains(&path) {
            list.push(path);
        }
    }

    /// Most recent output lines, capped to the externally visible window.
    pub fn output_tail(&self, max_lines: usize) -> &[String] {
        let start = self.output_lines.len().saturating_sub(max_lines);
        &self.output_lines[start..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Read,
    Edit,
    Create,
}

/// Emitted every time an agent tool-call targets a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileActivity {
    pub task_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub action: FileAction,
    pub path: String,
    pub observed_at: DateTime<Utc>,
}

/// A clarifying question blocking an agent until the user (or the
/// sidechannel on their behalf) answers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub id: String,
    pub task_id: String,
    pub prompt: String,
    pub suggested_answers: Vec<String>,
    pub answer: Option<String>,
    pub asked_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl PendingQuestion {
    pub fn new(id: String, task_id: impl Into<String>, prompt: impl Into<String>, suggested_answers: Vec<String>) -> Self {
        Self {
            id,
            task_id: task_id.into(),
            prompt: prompt.into(),
            suggested_answers,
            answer: None,
            asked_at: Utc::now(),
            answered_at: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingType {
    Security,
    Quality,
    Performance,
    Compliance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    Resolved,
    Dismissed,
}

/// A structured defect record extracted from agent output by pattern
/// matching (see the stream parser's finding rules).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub task_id: String,
    pub severity: Severity,
    pub finding_type: FindingType,
    pub title: String,
    pub description: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub remediation: Option<String>,
    pub reporting_role: String,
    pub status: FindingStatus,
}

/// A screenshot captured between static-fallback-pipeline waves, or on
/// demand by an agent, and attached to the owning task's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: String,
    pub task_id: String,
    pub phase_name: Option<String>,
    pub path: String,
    pub caption: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(
        id: String,
        task_id: impl Into<String>,
        phase_name: Option<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id,
            task_id: task_id.into(),
            phase_name,
            path: path.into(),
            caption: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_starts_queued() {
        let task = Task::new("task-001".into(), "do the thing", "default", "/work/task-001");
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(!task.is_terminal());
    }

    #[test]
    fn agent_terminal_states() {
        let mut agent = DynamicAgent::new("agent-001".into(), "task-001", "build", "Builder", "write code", "#3b82f6", "Terminal");
        assert!(!agent.is_terminal());
        agent.status = AgentStatus::Completed;
        assert!(agent.is_terminal());
    }

    #[test]
    fn record_file_deduplicates() {
        let mut agent = DynamicAgent::new("agent-001".into(), "task-001", "build", "Builder", "write code", "#3b82f6", "Terminal");
        agent.record_file(FileAction::Edit, "src/lib.rs");
        agent.record_file(FileAction::Edit, "src/lib.rs");
        assert_eq!(agent.files_modified, vec!["src/lib.rs".to_string()]);
    }

    #[test]
    fn output_tail_caps_window() {
        let mut agent = DynamicAgent::new("agent-001".into(), "task-001", "build", "Builder", "write code", "#3b82f6", "Terminal");
        for i in 0..10 {
            agent.output_lines.push(format!("line {i}"));
        }
        assert_eq!(agent.output_tail(3), &["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn question_answered_tracks_state() {
        let mut q = PendingQuestion::new("question-001".into(), "task-001", "proceed?", vec![]);
        assert!(!q.is_answered());
        q.answer = Some("yes".into());
        assert!(q.is_answered());
    }

    #[test]
    fn screenshot_records_owning_phase() {
        let shot = Screenshot::new("screenshot-001".into(), "task-001", Some("develop".into()), "/work/task-001/.relay/shots/1.png");
        assert_eq!(shot.phase_name.as_deref(), Some("develop"));
        assert!(shot.caption.is_none());
    }
}
