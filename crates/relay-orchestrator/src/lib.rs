pub mod engine;
pub mod executor;
pub mod fallback;
pub mod role_registry;
pub mod scheduler;

pub use engine::{Engine, MAX_CONCURRENT_TASKS};
pub use executor::{submit_task, task_not_found};
pub use role_registry::{RoleRecord, RoleRegistry};
pub use scheduler::{
    ask_question, await_many, await_one, await_question_answer, publish_event, spawn_agent,
    submit_question_answer, CompletionSignals, SpawnRequest, AWAIT_MANY_MAX_TIMEOUT, AWAIT_ONE_TIMEOUT,
};
