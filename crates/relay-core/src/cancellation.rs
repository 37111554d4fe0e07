use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Tracks one cancellation token per in-flight agent subprocess so a
/// wall-clock timeout (or an explicit kill) can reach the Subprocess
/// Runner's wait loop without a back-reference to the process handle.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: std::sync::Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `agent_id`, returning the token the runner should
    /// select against alongside the child process's stdout reads.
    pub fn register(&self, agent_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .expect("cancellation registry mutex poisoned")
            .insert(agent_id.to_string(), token.clone());
        token
    }

    /// Cancels the agent's token, if still registered. A no-op once
    /// the agent has already reached a terminal state and been removed.
    pub fn cancel(&self, agent_id: &str) {
        if let Some(token) = self
            .tokens
            .lock()
            .expect("cancellation registry mutex poisoned")
            .get(agent_id)
        {
            token.cancel();
        }
    }

    /// Drops the bookkeeping entry once an agent has exited.
    pub fn remove(&self, agent_id: &str) {
        self.tokens
            .lock()
            .expect("cancellation registry mutex poisoned")
            .remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_signals_the_registered_token() {
        let registry = CancellationRegistry::new();
        let token = registry.register("agent-001");
        assert!(!token.is_cancelled());
        registry.cancel("agent-001");
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_on_unknown_agent_is_a_noop() {
        let registry = CancellationRegistry::new();
        registry.cancel("agent-missing");
    }

    #[test]
    fn remove_detaches_bookkeeping() {
        let registry = CancellationRegistry::new();
        let token = registry.register("agent-001");
        registry.remove("agent-001");
        registry.cancel("agent-001");
        assert!(!token.is_cancelled());
    }
}
