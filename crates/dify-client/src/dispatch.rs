//! Routing of classified events to listener callbacks.

use crate::event::{
    MessageChunk, MessageEnd, MessageReplace, NodeFinished, NodeStarted, StreamErrorEvent,
    StreamEvent, TtsChunk, WorkflowFinished, WorkflowStarted,
};
use crate::sse::Frame;

/// Listener for classified stream events.
///
/// Every method defaults to a no-op, so implement only what you observe.
/// Workflow and node callbacks receive the nested `data` payload; message,
/// TTS and error callbacks receive the whole event. Listeners observe the
/// stream; they cannot change what the aggregator records.
pub trait EventHandler {
    fn on_message(&mut self, _chunk: &MessageChunk) {}
    fn on_agent_message(&mut self, _chunk: &MessageChunk) {}
    fn on_message_end(&mut self, _end: &MessageEnd) {}
    fn on_message_replace(&mut self, _replace: &MessageReplace) {}
    fn on_workflow_started(&mut self, _data: &WorkflowStarted) {}
    fn on_workflow_finished(&mut self, _data: &WorkflowFinished) {}
    fn on_node_started(&mut self, _data: &NodeStarted) {}
    fn on_node_finished(&mut self, _data: &NodeFinished) {}
    fn on_tts_message(&mut self, _chunk: &TtsChunk) {}
    fn on_tts_message_end(&mut self, _chunk: &TtsChunk) {}
    fn on_error(&mut self, _error: &StreamErrorEvent) {}
    fn on_ping(&mut self) {}
    /// Called for discriminators this crate does not model.
    fn on_unknown(&mut self, _name: &str, _payload: &Frame) {}
}

/// Listener that observes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

impl<H: EventHandler + ?Sized> EventHandler for &mut H {
    fn on_message(&mut self, chunk: &MessageChunk) {
        (**self).on_message(chunk)
    }
    fn on_agent_message(&mut self, chunk: &MessageChunk) {
        (**self).on_agent_message(chunk)
    }
    fn on_message_end(&mut self, end: &MessageEnd) {
        (**self).on_message_end(end)
    }
    fn on_message_replace(&mut self, replace: &MessageReplace) {
        (**self).on_message_replace(replace)
    }
    fn on_workflow_started(&mut self, data: &WorkflowStarted) {
        (**self).on_workflow_started(data)
    }
    fn on_workflow_finished(&mut self, data: &WorkflowFinished) {
        (**self).on_workflow_finished(data)
    }
    fn on_node_started(&mut self, data: &NodeStarted) {
        (**self).on_node_started(data)
    }
    fn on_node_finished(&mut self, data: &NodeFinished) {
        (**self).on_node_finished(data)
    }
    fn on_tts_message(&mut self, chunk: &TtsChunk) {
        (**self).on_tts_message(chunk)
    }
    fn on_tts_message_end(&mut self, chunk: &TtsChunk) {
        (**self).on_tts_message_end(chunk)
    }
    fn on_error(&mut self, error: &StreamErrorEvent) {
        (**self).on_error(error)
    }
    fn on_ping(&mut self) {
        (**self).on_ping()
    }
    fn on_unknown(&mut self, name: &str, payload: &Frame) {
        (**self).on_unknown(name, payload)
    }
}

/// Routes one event to its handler slot.
pub fn dispatch<H: EventHandler + ?Sized>(handler: &mut H, event: &StreamEvent) {
    match event {
        StreamEvent::Message(chunk) => handler.on_message(chunk),
        StreamEvent::AgentMessage(chunk) => handler.on_agent_message(chunk),
        StreamEvent::MessageEnd(end) => handler.on_message_end(end),
        StreamEvent::MessageReplace(replace) => handler.on_message_replace(replace),
        StreamEvent::WorkflowStarted(envelope) => handler.on_workflow_started(&envelope.data),
        StreamEvent::WorkflowFinished(envelope) => handler.on_workflow_finished(&envelope.data),
        StreamEvent::NodeStarted(envelope) => handler.on_node_started(&envelope.data),
        StreamEvent::NodeFinished(envelope) => handler.on_node_finished(&envelope.data),
        StreamEvent::TtsMessage(chunk) => handler.on_tts_message(chunk),
        StreamEvent::TtsMessageEnd(chunk) => handler.on_tts_message_end(chunk),
        StreamEvent::Error(error) => handler.on_error(error),
        StreamEvent::Ping => handler.on_ping(),
        StreamEvent::Unknown { name, payload } => handler.on_unknown(name, payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WorkflowEvent;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<String>,
    }

    impl EventHandler for Recorder {
        fn on_message(&mut self, chunk: &MessageChunk) {
            self.seen
                .push(format!("message:{}", chunk.answer.as_deref().unwrap_or("")));
        }
        fn on_node_finished(&mut self, data: &NodeFinished) {
            self.seen
                .push(format!("node:{}", data.node_id.as_deref().unwrap_or("")));
        }
        fn on_ping(&mut self) {
            self.seen.push("ping".into());
        }
    }

    #[test]
    fn routes_to_matching_slot_and_skips_unset_slots() {
        let mut recorder = Recorder::default();
        let events = [
            StreamEvent::Message(MessageChunk {
                answer: Some("a".into()),
                ..Default::default()
            }),
            StreamEvent::TtsMessage(TtsChunk::default()),
            StreamEvent::NodeFinished(WorkflowEvent {
                data: NodeFinished {
                    node_id: Some("n1".into()),
                    ..Default::default()
                },
                ..Default::default()
            }),
            StreamEvent::Ping,
        ];
        for event in &events {
            dispatch(&mut recorder, event);
        }
        assert_eq!(recorder.seen, vec!["message:a", "node:n1", "ping"]);
    }

    #[test]
    fn mutable_reference_forwards_to_inner_handler() {
        let mut recorder = Recorder::default();
        {
            let mut borrowed = &mut recorder;
            dispatch(&mut borrowed, &StreamEvent::Ping);
        }
        assert_eq!(recorder.seen, vec!["ping"]);
    }
}
