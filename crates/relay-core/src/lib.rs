pub mod cancellation;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event_bus;
pub mod store;
pub mod token;

pub use cancellation::CancellationRegistry;
pub use config::EngineConfig;
pub use conversation::ConversationRegistry;
pub use error::EngineError;
pub use event_bus::{conversation_stream, task_stream, EventBus, EventBusError, Subscription};
pub use store::{EngineStore, MAX_AGENTS_PER_TASK, MAX_PENDING_QUESTIONS};
pub use token::{generate_token, tokens_match};
