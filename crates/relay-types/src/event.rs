use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single message broadcast through the event bus.
///
/// Wire-serializes as a flat JSON object: the `type` tag sits alongside
/// whatever fields `properties` carries, matching the frames documented
/// on `/ws/task/{id}` and `/ws/console/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_as_flat_object() {
        let event = EngineEvent::new("output", json!({"line": "hello", "phase": "plan"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["line"], "hello");
        assert_eq!(value["phase"], "plan");
    }
}
