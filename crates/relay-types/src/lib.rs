mod event;
mod ids;
mod model;

pub use event::EngineEvent;
pub use ids::{
    next_agent_id, next_conversation_id, next_finding_id, next_question_id, next_screenshot_id,
    next_task_id,
};
pub use model::*;
