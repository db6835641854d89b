//! Folds a classified event stream into one [`StreamResult`].

use std::ops::ControlFlow;

use serde::Serialize;
use tracing::debug;

use crate::dispatch::{EventHandler, dispatch};
use crate::errors::DifyError;
use crate::event::{NodeFinished, Schema, StreamErrorEvent, StreamEvent, WorkflowFinished};
use crate::sse::DecodeMode;

/// Per-call stream processing options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Stop pulling events right after the first in-band `error` event.
    pub break_on_error: bool,
    pub decode_mode: DecodeMode,
    pub schema: Schema,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            break_on_error: true,
            decode_mode: DecodeMode::Lenient,
            schema: Schema::Canonical,
        }
    }
}

impl StreamOptions {
    pub fn break_on_error(mut self, break_on_error: bool) -> Self {
        self.break_on_error = break_on_error;
        self
    }

    pub fn decode_mode(mut self, mode: DecodeMode) -> Self {
        self.decode_mode = mode;
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }
}

/// Final aggregated view of one streaming response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    /// Concatenated fragments since the last replace. `None` if no text arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// `message_end` metadata (usage, retriever resources).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// `node_finished` payloads in arrival order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nodes_data: Vec<NodeFinished>,
    /// Terminal `workflow_finished` payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowFinished>,
    /// The error event that stopped consumption, if `break_on_error` was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamErrorEvent>,
    /// Every error event observed, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StreamErrorEvent>,
}

/// Running state across one event sequence.
#[derive(Debug)]
pub struct StreamAggregator {
    break_on_error: bool,
    answer_chunks: Vec<String>,
    result: StreamResult,
}

impl Default for StreamAggregator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StreamAggregator {
    pub fn new(break_on_error: bool) -> Self {
        Self {
            break_on_error,
            answer_chunks: Vec::new(),
            result: StreamResult::default(),
        }
    }

    /// Applies one event. `Break` means the caller must stop consuming.
    pub fn apply(&mut self, event: &StreamEvent) -> ControlFlow<()> {
        let result = &mut self.result;
        match event {
            StreamEvent::Message(chunk) | StreamEvent::AgentMessage(chunk) => {
                if let Some(answer) = &chunk.answer {
                    self.answer_chunks.push(answer.clone());
                }
                capture(&mut result.message_id, &chunk.message_id);
                capture(&mut result.task_id, &chunk.task_id);
                capture(&mut result.conversation_id, &chunk.conversation_id);
            }
            StreamEvent::MessageReplace(replace) => {
                if let Some(answer) = &replace.answer {
                    self.answer_chunks.clear();
                    self.answer_chunks.push(answer.clone());
                }
                if let Some(message_id) = non_empty(&replace.message_id) {
                    result.message_id = Some(message_id.to_owned());
                }
                capture(&mut result.task_id, &replace.task_id);
                capture(&mut result.conversation_id, &replace.conversation_id);
            }
            StreamEvent::MessageEnd(end) => {
                if let Some(metadata) = &end.metadata {
                    result.metadata = Some(metadata.clone());
                }
                capture(&mut result.message_id, &end.message_id);
                capture(&mut result.task_id, &end.task_id);
                capture(&mut result.conversation_id, &end.conversation_id);
            }
            StreamEvent::WorkflowStarted(envelope) => {
                capture(&mut result.workflow_run_id, &envelope.data.id);
                capture(&mut result.workflow_run_id, &envelope.workflow_run_id);
                capture(&mut result.task_id, &envelope.task_id);
            }
            StreamEvent::NodeFinished(envelope) => {
                result.nodes_data.push(envelope.data.clone());
            }
            StreamEvent::WorkflowFinished(envelope) => {
                capture(&mut result.workflow_run_id, &envelope.data.id);
                capture(&mut result.workflow_run_id, &envelope.workflow_run_id);
                capture(&mut result.task_id, &envelope.task_id);
                result.workflow = Some(envelope.data.clone());
            }
            StreamEvent::Error(error) => {
                result.errors.push(error.clone());
                if self.break_on_error {
                    result.error = Some(error.clone());
                    return ControlFlow::Break(());
                }
            }
            StreamEvent::NodeStarted(_)
            | StreamEvent::TtsMessage(_)
            | StreamEvent::TtsMessageEnd(_)
            | StreamEvent::Ping
            | StreamEvent::Unknown { .. } => {}
        }
        ControlFlow::Continue(())
    }

    pub fn finish(self) -> StreamResult {
        let mut result = self.result;
        if !self.answer_chunks.is_empty() {
            result.answer = Some(self.answer_chunks.concat());
        }
        result
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// First non-empty value wins.
fn capture(slot: &mut Option<String>, value: &Option<String>) {
    if slot.is_none()
        && let Some(value) = non_empty(value)
    {
        *slot = Some(value.to_owned());
    }
}

/// Dispatches every event to `handler`, aggregates it, and returns the result.
///
/// Events are pulled one at a time; after a breaking `error` event the source
/// is not polled again. A read failure or idle timeout mid-stream returns
/// `DifyError::StreamInterrupted` with everything aggregated up to that point.
pub fn process_stream<I, H>(
    events: I,
    handler: &mut H,
    options: &StreamOptions,
) -> Result<StreamResult, DifyError>
where
    I: IntoIterator<Item = Result<StreamEvent, DifyError>>,
    H: EventHandler + ?Sized,
{
    let mut aggregator = StreamAggregator::new(options.break_on_error);
    let mut processed = 0usize;
    for item in events {
        let event = match item {
            Ok(event) => event,
            Err(DifyError::Transport { message }) => {
                return Err(DifyError::StreamInterrupted {
                    message,
                    timed_out: false,
                    partial: Box::new(aggregator.finish()),
                });
            }
            Err(DifyError::Timeout { message }) => {
                return Err(DifyError::StreamInterrupted {
                    message,
                    timed_out: true,
                    partial: Box::new(aggregator.finish()),
                });
            }
            Err(other) => return Err(other),
        };
        processed += 1;
        dispatch(handler, &event);
        if aggregator.apply(&event).is_break() {
            debug!(processed, "stopping stream on error event");
            break;
        }
    }
    debug!(processed, "stream processed");
    Ok(aggregator.finish())
}
