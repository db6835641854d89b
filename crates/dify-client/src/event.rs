//! Typed stream events decoded from SSE frames.
//!
//! Each variant carries only the fields its event kind defines. Fields this
//! crate does not model are kept in `extra` so payloads survive intact.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::sse::Frame;

/// Canonical discriminator field.
pub const EVENT_FIELD: &str = "event";
/// Discriminator used by older platform versions.
pub const LEGACY_TYPE_FIELD: &str = "type";

/// Which discriminator fields the classifier honours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Schema {
    /// Only `"event"`.
    #[default]
    Canonical,
    /// `"event"`, then `"type"` when `"event"` is absent.
    LegacyTypeFallback,
}

/// Text fragment from `message` and `agent_message`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEnd {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    /// Token usage and retriever resources.
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Replaces everything streamed so far for the message with `answer`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageReplace {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Envelope of workflow and node events; the payload lives under `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "D: Serialize",
    deserialize = "D: DeserializeOwned + Default"
))]
pub struct WorkflowEvent<D> {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub data: D,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStarted {
    /// Workflow run id.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<u64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFinished {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// `succeeded`, `failed`, `stopped`...
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
    #[serde(default)]
    pub total_steps: Option<u64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStarted {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub predecessor_node_id: Option<String>,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFinished {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub predecessor_node_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub elapsed_time: Option<f64>,
    #[serde(default)]
    pub execution_metadata: Option<Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `tts_message` fragment or `tts_message_end` marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsChunk {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Base64 encoded audio. Empty on the end marker.
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// In-band platform error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamErrorEvent {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One classified stream event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Message(MessageChunk),
    AgentMessage(MessageChunk),
    MessageEnd(MessageEnd),
    MessageReplace(MessageReplace),
    WorkflowStarted(WorkflowEvent<WorkflowStarted>),
    WorkflowFinished(WorkflowEvent<WorkflowFinished>),
    NodeStarted(WorkflowEvent<NodeStarted>),
    NodeFinished(WorkflowEvent<NodeFinished>),
    TtsMessage(TtsChunk),
    TtsMessageEnd(TtsChunk),
    Error(StreamErrorEvent),
    Ping,
    /// Discriminator this crate does not know (or none at all).
    Unknown { name: String, payload: Frame },
}

/// A known event whose payload did not match its expected shape.
#[derive(Debug, thiserror::Error)]
#[error("invalid {name} event: {source}")]
pub struct ShapeError {
    pub name: String,
    /// The frame without its discriminator.
    pub payload: Frame,
    #[source]
    pub source: serde_json::Error,
}

impl ShapeError {
    /// Keeps the payload as an `Unknown` event.
    pub fn into_unknown(self) -> StreamEvent {
        StreamEvent::Unknown {
            name: self.name,
            payload: self.payload,
        }
    }
}

impl StreamEvent {
    /// Classifies a decoded frame by its discriminator.
    ///
    /// Unknown discriminators become `Unknown`. A known discriminator whose
    /// payload has the wrong shape is a [`ShapeError`], except for `error`
    /// events, which are always recovered field by field.
    pub fn from_frame(mut frame: Frame, schema: Schema) -> Result<Self, ShapeError> {
        let name = match take_discriminator(&mut frame, EVENT_FIELD) {
            Some(name) => name,
            None if schema == Schema::LegacyTypeFallback => {
                take_discriminator(&mut frame, LEGACY_TYPE_FIELD).unwrap_or_default()
            }
            None => String::new(),
        };
        let event = match name.as_str() {
            "message" => Self::Message(decode(&name, frame)?),
            "agent_message" => Self::AgentMessage(decode(&name, frame)?),
            "message_end" => Self::MessageEnd(decode(&name, frame)?),
            "message_replace" => Self::MessageReplace(decode(&name, frame)?),
            "workflow_started" => Self::WorkflowStarted(decode(&name, frame)?),
            "workflow_finished" => Self::WorkflowFinished(decode(&name, frame)?),
            "node_started" => Self::NodeStarted(decode(&name, frame)?),
            "node_finished" => Self::NodeFinished(decode(&name, frame)?),
            "tts_message" => Self::TtsMessage(decode(&name, frame)?),
            "tts_message_end" => Self::TtsMessageEnd(decode(&name, frame)?),
            "error" => Self::Error(match decode(&name, frame) {
                Ok(error) => error,
                Err(shape) => {
                    warn!(error = %shape.source, "recovering error event with unexpected shape");
                    StreamErrorEvent::from_raw(shape.payload)
                }
            }),
            "ping" => Self::Ping,
            _ => Self::Unknown {
                name,
                payload: frame,
            },
        };
        Ok(event)
    }

    /// Wire discriminator of this event.
    pub fn name(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::AgentMessage(_) => "agent_message",
            Self::MessageEnd(_) => "message_end",
            Self::MessageReplace(_) => "message_replace",
            Self::WorkflowStarted(_) => "workflow_started",
            Self::WorkflowFinished(_) => "workflow_finished",
            Self::NodeStarted(_) => "node_started",
            Self::NodeFinished(_) => "node_finished",
            Self::TtsMessage(_) => "tts_message",
            Self::TtsMessageEnd(_) => "tts_message_end",
            Self::Error(_) => "error",
            Self::Ping => "ping",
            Self::Unknown { name, .. } => name,
        }
    }
}

fn take_discriminator(frame: &mut Frame, field: &str) -> Option<String> {
    match frame.get(field) {
        Some(Value::String(_)) => match frame.remove(field) {
            Some(Value::String(name)) => Some(name),
            _ => None,
        },
        _ => None,
    }
}

fn decode<T: DeserializeOwned>(name: &str, frame: Frame) -> Result<T, ShapeError> {
    let value = Value::Object(frame);
    T::deserialize(&value).map_err(|source| ShapeError {
        name: name.to_owned(),
        payload: match value {
            Value::Object(frame) => frame,
            _ => Frame::new(),
        },
        source,
    })
}

impl StreamErrorEvent {
    /// Pulls what it can out of an error payload of any shape.
    ///
    /// Non-string text fields are kept as their JSON text. A `status` that
    /// is not a valid code moves to `extra["status_raw"]`.
    pub fn from_raw(mut frame: Frame) -> Self {
        let task_id = take_text(&mut frame, "task_id");
        let message_id = take_text(&mut frame, "message_id");
        let code = take_text(&mut frame, "code");
        let message = take_text(&mut frame, "message");
        let status = match frame.remove("status") {
            None | Some(Value::Null) => None,
            Some(raw) => {
                let parsed = match &raw {
                    Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
                    Value::String(s) => s.trim().parse::<u16>().ok(),
                    _ => None,
                };
                if parsed.is_none() {
                    frame.insert("status_raw".into(), raw);
                }
                parsed
            }
        };
        Self {
            task_id,
            message_id,
            status,
            code,
            message,
            extra: frame,
        }
    }
}

fn take_text(frame: &mut Frame, key: &str) -> Option<String> {
    match frame.remove(key)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: Value) -> Frame {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn classifies_message_chunk() {
        let event = StreamEvent::from_frame(
            frame(serde_json::json!({
                "event": "message",
                "answer": "Hi",
                "message_id": "m1",
                "task_id": "t1",
                "conversation_id": "c1",
                "created_at": 1705395332
            })),
            Schema::Canonical,
        )
        .expect("decode");
        let StreamEvent::Message(chunk) = event else {
            panic!("expected message, got {event:?}");
        };
        assert_eq!(chunk.answer.as_deref(), Some("Hi"));
        assert_eq!(chunk.message_id.as_deref(), Some("m1"));
        assert_eq!(chunk.conversation_id.as_deref(), Some("c1"));
        assert!(chunk.extra.contains_key("created_at"));
        assert!(!chunk.extra.contains_key("event"));
    }

    #[test]
    fn node_finished_payload_comes_from_data() {
        let event = StreamEvent::from_frame(
            frame(serde_json::json!({
                "event": "node_finished",
                "task_id": "t1",
                "workflow_run_id": "r1",
                "data": {
                    "id": "exec-1",
                    "node_id": "n1",
                    "node_type": "llm",
                    "title": "LLM",
                    "status": "succeeded",
                    "outputs": {"text": "hello"},
                    "elapsed_time": 0.42,
                    "process_data": {"model": "x"}
                }
            })),
            Schema::Canonical,
        )
        .expect("decode");
        let StreamEvent::NodeFinished(envelope) = event else {
            panic!("expected node_finished");
        };
        assert_eq!(envelope.workflow_run_id.as_deref(), Some("r1"));
        assert_eq!(envelope.data.node_id.as_deref(), Some("n1"));
        assert_eq!(envelope.data.outputs, Some(serde_json::json!({"text": "hello"})));
        assert!(envelope.data.extra.contains_key("process_data"));
    }

    #[test]
    fn missing_data_defaults_to_empty_payload() {
        let event = StreamEvent::from_frame(
            frame(serde_json::json!({"event": "workflow_started", "task_id": "t1"})),
            Schema::Canonical,
        )
        .expect("decode");
        assert!(matches!(
            event,
            StreamEvent::WorkflowStarted(WorkflowEvent { ref data, .. }) if data.id.is_none()
        ));
    }

    #[test]
    fn unknown_and_missing_discriminators_are_unknown() {
        let event = StreamEvent::from_frame(
            frame(serde_json::json!({"event": "agent_thought", "thought": "hmm"})),
            Schema::Canonical,
        )
        .expect("decode");
        assert_eq!(event.name(), "agent_thought");
        assert!(matches!(event, StreamEvent::Unknown { .. }));

        let event = StreamEvent::from_frame(
            frame(serde_json::json!({"error": "bad frame", "raw_data": "{"})),
            Schema::Canonical,
        )
        .expect("decode");
        assert!(matches!(event, StreamEvent::Unknown { ref name, .. } if name.is_empty()));
    }

    #[test]
    fn legacy_type_field_only_with_fallback_schema() {
        let legacy = serde_json::json!({"type": "message", "answer": "old"});
        let canonical = StreamEvent::from_frame(frame(legacy.clone()), Schema::Canonical)
            .expect("decode");
        assert!(matches!(canonical, StreamEvent::Unknown { .. }));

        let fallback = StreamEvent::from_frame(frame(legacy), Schema::LegacyTypeFallback)
            .expect("decode");
        assert!(matches!(
            fallback,
            StreamEvent::Message(MessageChunk { answer: Some(ref a), .. }) if a == "old"
        ));
    }

    #[test]
    fn wrong_shape_for_known_event_is_an_error() {
        let err = StreamEvent::from_frame(
            frame(serde_json::json!({"event": "node_finished", "data": {"index": "first"}})),
            Schema::Canonical,
        )
        .expect_err("bad shape");
        assert_eq!(err.name, "node_finished");
        assert!(err.payload.contains_key("data"));
        assert!(matches!(err.into_unknown(), StreamEvent::Unknown { ref name, .. } if name == "node_finished"));
    }

    #[test]
    fn error_event_with_odd_field_types_is_recovered() {
        let event = StreamEvent::from_frame(
            frame(serde_json::json!({
                "event": "error",
                "status": "500",
                "code": 42,
                "message": "model overloaded",
                "task_id": "t1",
            })),
            Schema::Canonical,
        )
        .expect("error events always decode");
        match event {
            StreamEvent::Error(error) => {
                assert_eq!(error.status, Some(500));
                assert_eq!(error.code.as_deref(), Some("42"));
                assert_eq!(error.message.as_deref(), Some("model overloaded"));
                assert_eq!(error.task_id.as_deref(), Some("t1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unparseable_error_status_is_kept_raw() {
        let error = StreamErrorEvent::from_raw(frame(serde_json::json!({
            "status": "teapot",
            "message": ["a", "b"],
        })));
        assert_eq!(error.status, None);
        assert_eq!(error.message.as_deref(), Some("[\"a\",\"b\"]"));
        assert_eq!(error.extra.get("status_raw"), Some(&serde_json::json!("teapot")));
    }

    #[test]
    fn serializes_with_event_tag() {
        let value = serde_json::to_value(StreamEvent::Ping).expect("serialize");
        assert_eq!(value, serde_json::json!({"event": "ping"}));
    }
}
