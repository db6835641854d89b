//! Lazy event stream over an unread response body.

use std::io::BufRead;

use tracing::warn;

use crate::aggregate::{StreamOptions, StreamResult, process_stream};
use crate::dispatch::{EventHandler, NoopHandler};
use crate::errors::DifyError;
use crate::event::StreamEvent;
use crate::sse::{DecodeMode, RawLines, SseDecoder};

/// Line source of a live response body.
pub type BodyLines = RawLines<Box<dyn BufRead + Send>>;

/// Lazy, single-pass sequence of classified events.
///
/// Never rewinds: once consumed, the only way to see the events again is to
/// issue the request again.
pub struct EventStream<L> {
    frames: SseDecoder<L>,
    options: StreamOptions,
}

impl EventStream<BodyLines> {
    /// Wraps an unread response body.
    pub fn from_body(body: Box<dyn BufRead + Send>, options: StreamOptions) -> Self {
        Self::new(RawLines::new(body), options)
    }
}

impl<L> EventStream<L>
where
    L: Iterator<Item = std::io::Result<String>>,
{
    pub fn new(lines: L, options: StreamOptions) -> Self {
        Self {
            frames: SseDecoder::with_mode(lines, options.decode_mode),
            options,
        }
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Consumes the stream, notifying `handler` of every event.
    pub fn process<H: EventHandler + ?Sized>(
        self,
        handler: &mut H,
    ) -> Result<StreamResult, DifyError> {
        let options = self.options;
        process_stream(self, handler, &options)
    }

    /// Consumes the stream without a listener.
    pub fn collect_result(self) -> Result<StreamResult, DifyError> {
        self.process(&mut NoopHandler)
    }
}

impl<L> Iterator for EventStream<L>
where
    L: Iterator<Item = std::io::Result<String>>,
{
    type Item = Result<StreamEvent, DifyError>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = match self.frames.next()? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e)),
        };
        match StreamEvent::from_frame(frame, self.options.schema) {
            Ok(event) => Some(Ok(event)),
            Err(shape) => match self.options.decode_mode {
                DecodeMode::Lenient => {
                    warn!(
                        event = %shape.name,
                        error = %shape.source,
                        "keeping event with unexpected shape as unknown"
                    );
                    Some(Ok(shape.into_unknown()))
                }
                DecodeMode::Strict => Some(Err(DifyError::Decode {
                    message: shape.to_string(),
                })),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestLines = std::vec::IntoIter<std::io::Result<String>>;

    fn stream(raw: &[&str], options: StreamOptions) -> EventStream<TestLines> {
        let lines: Vec<std::io::Result<String>> =
            raw.iter().map(|s| Ok(s.to_string())).collect();
        EventStream::new(lines.into_iter(), options)
    }

    #[test]
    fn decodes_message_turn_into_result() {
        let result = stream(
            &[
                "data: {\"event\":\"message\",\"answer\":\"Hi\",\"message_id\":\"m1\"}",
                "data: {\"event\":\"message_end\",\"message_id\":\"m1\",\"metadata\":{\"usage\":{\"total_tokens\":5}}}",
                "data: [DONE]",
            ],
            StreamOptions::default(),
        )
        .collect_result()
        .expect("result");
        assert_eq!(result.message_id.as_deref(), Some("m1"));
        assert_eq!(result.answer.as_deref(), Some("Hi"));
        assert_eq!(
            result.metadata,
            Some(serde_json::json!({"usage": {"total_tokens": 5}}))
        );
        assert!(result.error.is_none());
    }

    #[test]
    fn malformed_frame_does_not_stop_dispatch() {
        struct Pings(usize);
        impl EventHandler for Pings {
            fn on_ping(&mut self) {
                self.0 += 1;
            }
        }

        let mut pings = Pings(0);
        stream(
            &["data: {not valid json", "data: {\"event\":\"ping\"}"],
            StreamOptions::default(),
        )
        .process(&mut pings)
        .expect("no error");
        assert_eq!(pings.0, 1);
    }

    #[test]
    fn badly_shaped_known_event_is_kept_leniently_and_surfaced_strictly() {
        let raw = [
            "data: {\"event\":\"node_finished\",\"data\":{\"index\":\"first\"}}",
            "data: {\"event\":\"ping\"}",
        ];
        let events: Vec<_> = stream(&raw, StreamOptions::default()).collect();
        assert_eq!(events.len(), 2);
        assert!(
            matches!(events[0], Ok(StreamEvent::Unknown { ref name, .. }) if name == "node_finished")
        );
        assert!(matches!(events[1], Ok(StreamEvent::Ping)));

        let strict = StreamOptions::default().decode_mode(DecodeMode::Strict);
        let err = stream(&raw, strict).collect_result().expect_err("strict");
        assert!(
            matches!(err, DifyError::Decode { ref message } if message.contains("node_finished"))
        );
    }

    #[test]
    fn oddly_typed_error_event_still_stops_the_stream() {
        for mode in [DecodeMode::Lenient, DecodeMode::Strict] {
            let result = stream(
                &[
                    "data: {\"event\":\"message\",\"answer\":\"a\"}",
                    "data: {\"event\":\"error\",\"status\":\"500\",\"code\":\"internal\",\"message\":\"boom\"}",
                    "data: {\"event\":\"message\",\"answer\":\"b\"}",
                ],
                StreamOptions::default().decode_mode(mode),
            )
            .collect_result()
            .expect("result");
            assert_eq!(result.answer.as_deref(), Some("a"));
            let error = result.error.expect("error recorded");
            assert_eq!(error.status, Some(500));
            assert_eq!(error.message.as_deref(), Some("boom"));
            assert_eq!(result.errors.len(), 1);
        }
    }

    #[test]
    fn workflow_stream_collects_nodes_and_terminal_data() {
        let result = stream(
            &[
                "data: {\"event\":\"workflow_started\",\"task_id\":\"t1\",\"workflow_run_id\":\"r1\",\"data\":{\"id\":\"r1\",\"workflow_id\":\"w1\",\"sequence_number\":3}}",
                "data: {\"event\":\"node_started\",\"data\":{\"node_id\":\"n1\",\"node_type\":\"start\"}}",
                "data: {\"event\":\"node_finished\",\"data\":{\"node_id\":\"n1\",\"status\":\"succeeded\"}}",
                "data: {\"event\":\"node_finished\",\"data\":{\"node_id\":\"n2\",\"status\":\"succeeded\"}}",
                "data: {\"event\":\"workflow_finished\",\"data\":{\"id\":\"r1\",\"status\":\"succeeded\",\"outputs\":{\"text\":\"done\"},\"elapsed_time\":1.5}}",
            ],
            StreamOptions::default(),
        )
        .collect_result()
        .expect("result");
        assert_eq!(result.workflow_run_id.as_deref(), Some("r1"));
        assert_eq!(result.task_id.as_deref(), Some("t1"));
        assert_eq!(result.nodes_data.len(), 2);
        let workflow = result.workflow.expect("workflow");
        assert_eq!(workflow.outputs, Some(serde_json::json!({"text": "done"})));
        assert_eq!(workflow.elapsed_time, Some(1.5));
    }
}
