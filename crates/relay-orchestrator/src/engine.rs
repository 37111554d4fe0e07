use std::sync::Arc;

use relay_core::{CancellationRegistry, ConversationRegistry, EngineConfig, EngineStore, EventBus};
use tokio::sync::Semaphore;

use crate::role_registry::RoleRegistry;
use crate::scheduler::CompletionSignals;

/// How many tasks may be admitted to run concurrently in this process.
/// Agent subprocesses still parallelize freely at the OS level; this
/// only bounds how many task *orchestrators* are in flight at once.
pub const MAX_CONCURRENT_TASKS: usize = 5;

/// Everything the scheduler, task executor, and fallback pipeline share:
/// one store of tasks/agents/findings, one event bus, one role table,
/// one cancellation registry, and the static configuration they all
/// read from. `relay-server` holds one `Engine` behind its `AppState`
/// for the life of the process.
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<EngineStore>,
    pub events: EventBus,
    pub roles: RoleRegistry,
    pub cancellations: CancellationRegistry,
    /// Which task each console conversation is currently forwarding.
    pub conversations: ConversationRegistry,
    pub config: Arc<EngineConfig>,
    /// Bearer token every sidechannel invocation must present to call
    /// back into the Internal Coordination API. One per process
    /// lifetime -- see `relay_core::token`.
    pub sidechannel_token: Arc<str>,
    /// Admission gate bounding concurrently running task orchestrators.
    pub admission: Arc<Semaphore>,
    /// Per-agent completion signals, shared across every call so
    /// `await_one`/`await_many` observe the same channel `spawn_agent`
    /// registered.
    pub completions: CompletionSignals<bool>,
    /// Per-question answer signals, keyed by question id. Separate from
    /// `completions` since agent and question ids are independent
    /// namespaces with independent lifetimes. Carries the answered
    /// snapshot itself, since the question table entry is removed as
    /// soon as it's answered.
    pub question_signals: CompletionSignals<Option<relay_types::PendingQuestion>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            store: Arc::new(EngineStore::new()),
            events: EventBus::new(),
            roles: RoleRegistry::new(),
            cancellations: CancellationRegistry::new(),
            conversations: ConversationRegistry::new(),
            config: Arc::new(config),
            sidechannel_token: relay_core::generate_token().into(),
            admission: Arc::new(Semaphore::new(MAX_CONCURRENT_TASKS)),
            completions: CompletionSignals::default(),
            question_signals: CompletionSignals::default(),
        }
    }
}
