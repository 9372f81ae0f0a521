use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: String,
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
    fn event_round_trips() {
        let event = EngineEvent::new("session.status", json!({"status": "running"}));
        let raw = serde_json::to_string(&event).expect("serialize");
        let back: EngineEvent = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.event_type, "session.status");
        assert_eq!(back.properties["status"], "running");
    }
}
