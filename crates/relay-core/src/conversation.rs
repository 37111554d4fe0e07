use std::collections::HashMap;
use std::sync::Mutex;

/// Maps a console conversation id to the task it currently drives, so a
/// `/ws/console/{id}` subscriber can be handed the subset of that task's
/// frames. A conversation with no active task simply forwards nothing
/// until a `user-message` frame starts one.
#[derive(Clone, Default)]
pub struct ConversationRegistry {
    active_task: std::sync::Arc<Mutex<HashMap<String, String>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_task(&self, conversation_id: &str) -> Option<String> {
        self.active_task
            .lock()
            .expect("conversation registry lock poisoned")
            .get(conversation_id)
            .cloned()
    }

    pub fn set_active_task(&self, conversation_id: &str, task_id: &str) {
        self.active_task
            .lock()
            .expect("conversation registry lock poisoned")
            .insert(conversation_id.to_string(), task_id.to_string());
    }

    /// The conversation, if any, currently forwarding `task_id`'s
    /// events. Cardinality here is small (interactive consoles, not a
    /// bulk index), so a linear scan is fine.
    pub fn conversation_for_task(&self, task_id: &str) -> Option<String> {
        self.active_task
            .lock()
            .expect("conversation registry lock poisoned")
            .iter()
            .find(|(_, t)| t.as_str() == task_id)
            .map(|(c, _)| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_conversation_has_no_active_task() {
        let registry = ConversationRegistry::new();
        assert!(registry.active_task("conversation-001").is_none());
    }

    #[test]
    fn setting_the_active_task_makes_it_visible() {
        let registry = ConversationRegistry::new();
        registry.set_active_task("conversation-001", "task-001");
        assert_eq!(registry.active_task("conversation-001").as_deref(), Some("task-001"));
    }

    #[test]
    fn reverse_lookup_finds_the_owning_conversation() {
        let registry = ConversationRegistry::new();
        registry.set_active_task("conversation-001", "task-001");
        assert_eq!(registry.conversation_for_task("task-001").as_deref(), Some("conversation-001"));
        assert!(registry.conversation_for_task("task-999").is_none());
    }
}
