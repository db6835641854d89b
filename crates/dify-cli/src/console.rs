use std::io::Write;

use dify_client::event::{MessageReplace, NodeStarted, StreamErrorEvent, TtsChunk};
use dify_client::{EventHandler, MessageChunk, NodeFinished, WorkflowFinished};

/// Prints answer fragments to `out` and progress lines to `progress`.
pub struct ConsoleHandler<O, P> {
    out: O,
    progress: P,
    wrote_text: bool,
    streamed: bool,
}

impl ConsoleHandler<std::io::Stdout, std::io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdout(), std::io::stderr())
    }
}

impl<O: Write, P: Write> ConsoleHandler<O, P> {
    pub fn new(out: O, progress: P) -> Self {
        Self {
            out,
            progress,
            wrote_text: false,
            streamed: false,
        }
    }

    /// Ends the answer line if any text was printed.
    pub fn finish(&mut self) {
        if self.wrote_text {
            let _ = writeln!(self.out);
            self.wrote_text = false;
        }
        let _ = self.out.flush();
    }

    /// Whether any answer text reached `out`.
    pub fn streamed_text(&self) -> bool {
        self.streamed
    }

    #[cfg(test)]
    fn into_parts(self) -> (O, P) {
        (self.out, self.progress)
    }

    fn text(&mut self, text: Option<&str>) {
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            let _ = write!(self.out, "{text}");
            let _ = self.out.flush();
            self.wrote_text = true;
            self.streamed = true;
        }
    }
}

impl<O: Write, P: Write> EventHandler for ConsoleHandler<O, P> {
    fn on_message(&mut self, chunk: &MessageChunk) {
        self.text(chunk.answer.as_deref());
    }

    fn on_agent_message(&mut self, chunk: &MessageChunk) {
        self.text(chunk.answer.as_deref());
    }

    fn on_message_replace(&mut self, replace: &MessageReplace) {
        if self.wrote_text {
            let _ = writeln!(self.out);
        }
        let _ = writeln!(self.progress, "[answer replaced]");
        self.wrote_text = false;
        self.text(replace.answer.as_deref());
    }

    fn on_node_started(&mut self, data: &NodeStarted) {
        let _ = writeln!(
            self.progress,
            "[node] {} ({}) started",
            data.title.as_deref().or(data.node_id.as_deref()).unwrap_or("?"),
            data.node_type.as_deref().unwrap_or("?"),
        );
    }

    fn on_node_finished(&mut self, data: &NodeFinished) {
        let _ = writeln!(
            self.progress,
            "[node] {} {}",
            data.title.as_deref().or(data.node_id.as_deref()).unwrap_or("?"),
            data.status.as_deref().unwrap_or("finished"),
        );
    }

    fn on_workflow_finished(&mut self, data: &WorkflowFinished) {
        let _ = writeln!(
            self.progress,
            "[workflow] {}",
            data.status.as_deref().unwrap_or("finished")
        );
    }

    fn on_tts_message_end(&mut self, _chunk: &TtsChunk) {
        let _ = writeln!(self.progress, "[tts] audio complete");
    }

    fn on_error(&mut self, error: &StreamErrorEvent) {
        let _ = writeln!(
            self.progress,
            "[error] {}: {}",
            error.code.as_deref().unwrap_or("unknown"),
            error.message.as_deref().unwrap_or("")
        );
    }
}
