//! Line-oriented SSE frame decoder.
//!
//! Every platform event arrives on one `data:` line carrying a JSON object.
//! The decoder is lenient by default: a frame that does not parse is logged
//! and dropped so one corrupted chunk never ends the stream.

use std::io::BufRead;

use tracing::{debug, warn};

use crate::errors::DifyError;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";
const LOG_EXCERPT_CHARS: usize = 100;

/// One decoded `data:` payload.
pub type Frame = serde_json::Map<String, serde_json::Value>;

/// How the decoder treats a `data:` payload that is not a JSON object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeMode {
    /// Drop the frame with a warning and keep reading.
    #[default]
    Lenient,
    /// Yield `DifyError::Decode` for the frame, then keep reading.
    Strict,
}

/// Result of looking at one raw line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LineOutcome {
    /// Blank line, comment, or a non-`data` field.
    Skip,
    /// `data: [DONE]`.
    Done,
    Frame(Frame),
    Malformed { reason: String, excerpt: String },
}

pub(crate) fn decode_line(line: &str) -> LineOutcome {
    let line = line.trim_end_matches('\r');
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Skip;
    };
    let payload = rest.strip_prefix(' ').unwrap_or(rest).trim();
    if payload.is_empty() {
        return LineOutcome::Skip;
    }
    if payload == DONE_SENTINEL {
        return LineOutcome::Done;
    }
    let excerpt = || payload.chars().take(LOG_EXCERPT_CHARS).collect::<String>();
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => LineOutcome::Frame(map),
        Ok(other) => LineOutcome::Malformed {
            reason: format!("expected a JSON object, got {}", json_kind(&other)),
            excerpt: excerpt(),
        },
        Err(e) => LineOutcome::Malformed {
            reason: e.to_string(),
            excerpt: excerpt(),
        },
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Line reader that tolerates invalid UTF-8.
///
/// Unlike [`BufRead::lines`], a line with invalid bytes is decoded lossily
/// instead of failing, so only genuine I/O errors reach the caller.
pub struct RawLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: BufRead> RawLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for RawLines<R> {
    type Item = std::io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                }
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
                let line = match std::str::from_utf8(&self.buf) {
                    Ok(text) => text.to_owned(),
                    Err(e) => {
                        warn!(error = %e, "replacing invalid UTF-8 in stream line");
                        String::from_utf8_lossy(&self.buf).into_owned()
                    }
                };
                Some(Ok(line))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Lazy decoder from raw lines to JSON objects.
///
/// Ends when the line source is exhausted or on `[DONE]`. A read error ends
/// the sequence after yielding one error: `DifyError::Timeout` when the read
/// timed out, `DifyError::Transport` otherwise.
pub struct SseDecoder<L> {
    lines: L,
    mode: DecodeMode,
    finished: bool,
}

impl<L> SseDecoder<L>
where
    L: Iterator<Item = std::io::Result<String>>,
{
    pub fn new(lines: L) -> Self {
        Self::with_mode(lines, DecodeMode::default())
    }

    pub fn with_mode(lines: L, mode: DecodeMode) -> Self {
        Self {
            lines,
            mode,
            finished: false,
        }
    }
}

impl<R: BufRead> SseDecoder<RawLines<R>> {
    /// Decodes a response body as it is read.
    pub fn from_reader(reader: R, mode: DecodeMode) -> Self {
        Self::with_mode(RawLines::new(reader), mode)
    }
}

impl<L> Iterator for SseDecoder<L>
where
    L: Iterator<Item = std::io::Result<String>>,
{
    type Item = Result<Frame, DifyError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                    self.finished = true;
                    return Some(Err(DifyError::Timeout {
                        message: format!("stream read timed out: {e}"),
                    }));
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(DifyError::transport(format!("stream read failed: {e}"))));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            };
            match decode_line(&line) {
                LineOutcome::Skip => continue,
                LineOutcome::Done => {
                    debug!("received [DONE] sentinel");
                    self.finished = true;
                    return None;
                }
                LineOutcome::Frame(frame) => return Some(Ok(frame)),
                LineOutcome::Malformed { reason, excerpt } => match self.mode {
                    DecodeMode::Lenient => {
                        warn!(%reason, frame = %excerpt, "dropping malformed SSE frame");
                        continue;
                    }
                    DecodeMode::Strict => {
                        return Some(Err(DifyError::Decode {
                            message: format!("{reason}: {excerpt}"),
                        }));
                    }
                },
            }
        }
    }
}
