use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a single AI-assistant invocation attached to a [`super::Task`].
///
/// Invariants enforced by the repository/executor, not by this type alone:
/// at most one conversation per task in `Pending`/`Running`, and no
/// transition out of a terminal status once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConversationStatus::Success | ConversationStatus::Failed | ConversationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConversationStatus::Pending => "pending",
            ConversationStatus::Running => "running",
            ConversationStatus::Success => "success",
            ConversationStatus::Failed => "failed",
            ConversationStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Recognized keys of `Conversation.env_params`. Unknown keys in the source
/// JSON are ignored, not rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvParams {
    pub model: Option<String>,
    #[serde(default)]
    pub is_plan_mode: bool,
}

impl EnvParams {
    pub fn from_json(value: &Value) -> Self {
        let model = value
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        let is_plan_mode = value
            .get("is_plan_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self { model, is_plan_mode }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub task_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub execution_time: Option<chrono::DateTime<chrono::Utc>>,
    pub env_params: Value,
    pub status: ConversationStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Conversation {
    pub fn parsed_env_params(&self) -> EnvParams {
        EnvParams::from_json(&self.env_params)
    }

    /// True once `execution_time` has arrived (or was never set).
    pub fn is_due(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.execution_time.map(|t| t <= now).unwrap_or(true)
    }
}

/// Structured terminal result parsed from the assistant's final `"result"`
/// NDJSON event, when one is emitted. See the assistant output contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResult {
    pub id: String,
    pub conversation_id: String,
    pub task_id: String,
    pub result_type: String,
    pub subtype: String,
    pub is_error: bool,
    pub duration_ms: i64,
    pub duration_api_ms: i64,
    pub num_turns: i64,
    pub result: String,
    pub session_id: String,
    pub total_cost_usd: f64,
    pub usage: Value,
}

/// Raw shape of the assistant's terminal NDJSON event. Unknown fields are
/// ignored by `serde` by default; any number of non-result lines may precede
/// or follow it on the stream.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantResultEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub duration_api_ms: i64,
    #[serde(default)]
    pub num_turns: i64,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub usage: Value,
}

impl AssistantResultEvent {
    pub const TYPE: &'static str = "result";

    /// Scan newline-delimited JSON output for the terminal `"type": "result"`
    /// object. Lines that fail to parse as JSON, or parse but aren't a result
    /// event, are skipped rather than treated as errors.
    pub fn find_in_stream(lines: &[String]) -> Option<Self> {
        lines.iter().rev().find_map(|line| {
            let value: Value = serde_json::from_str(line).ok()?;
            if value.get("type").and_then(Value::as_str) != Some(Self::TYPE) {
                return None;
            }
            serde_json::from_value(value).ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_params_ignores_unknown_keys() {
        let v = serde_json::json!({"model": "opus", "unexpected": 42});
        let parsed = EnvParams::from_json(&v);
        assert_eq!(parsed.model.as_deref(), Some("opus"));
        assert!(!parsed.is_plan_mode);
    }

    #[test]
    fn env_params_default_to_missing() {
        let v = serde_json::json!({});
        let parsed = EnvParams::from_json(&v);
        assert!(parsed.model.is_none());
        assert!(!parsed.is_plan_mode);
    }

    #[test]
    fn result_event_found_among_noise() {
        let lines = vec![
            r#"{"type":"system","subtype":"init"}"#.to_string(),
            r#"{"type":"assistant","message":{}}"#.to_string(),
            r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":10,"duration_api_ms":5,"num_turns":2,"result":"done","session_id":"s-1","total_cost_usd":0.02,"usage":{}}"#.to_string(),
            "not json at all".to_string(),
        ];
        let found = AssistantResultEvent::find_in_stream(&lines).expect("result event");
        assert_eq!(found.session_id, "s-1");
        assert!(!found.is_error);
    }

    #[test]
    fn result_event_absent_returns_none() {
        let lines = vec![r#"{"type":"assistant"}"#.to_string()];
        assert!(AssistantResultEvent::find_in_stream(&lines).is_none());
    }
}
