use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 常用事件主题
pub mod topics {
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRYING: &str = "task.retrying";
    pub const VM_STARTING: &str = "vm.starting";
    pub const VM_READY: &str = "vm.ready";
    pub const VM_FAILED: &str = "vm.failed";
    pub const VM_DELETED: &str = "vm.deleted";
    pub const VM_COMMAND_COMPLETED: &str = "vm.command.completed";
    pub const VM_ALL: &str = "vm.*";
}

/// 事件总线中的瞬时事件，只在分发期间存在
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// 订阅标识
pub type SubscriptionId = String;

/// 判断订阅主题是否匹配事件主题
///
/// 支持精确匹配和尾部通配符，例如 `vm.*` 匹配 `vm.ready` 与 `vm.command.completed`。
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.') && rest.len() > 1)
            .unwrap_or(false),
        None => pattern == topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("task.completed", "task.completed"));
        assert!(!topic_matches("task.completed", "task.failed"));
        assert!(topic_matches("vm.*", "vm.ready"));
        assert!(topic_matches("vm.*", "vm.command.completed"));
        assert!(!topic_matches("vm.*", "vm"));
        assert!(!topic_matches("vm.*", "vmx.ready"));
        assert!(topic_matches("*", "anything"));
    }

    #[test]
    fn test_event_roundtrip_keeps_id() {
        let event = Event::new(topics::VM_READY, serde_json::json!({"sandbox_id": "sb"}));
        let parsed = Event::deserialize(&event.serialize().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }
}
