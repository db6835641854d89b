//! Blocking streaming client for the Dify app API.
//!
//! A run is a pipeline: the response body is split into SSE frames, frames are
//! classified into [`StreamEvent`]s, every event is handed to an
//! [`EventHandler`] and folded into a [`StreamResult`].
//!
//! # Usage
//!
//! ```no_run
//! use dify_client::prelude::*;
//!
//! # fn main() -> Result<(), DifyError> {
//! struct Printer;
//!
//! impl EventHandler for Printer {
//!     fn on_message(&mut self, chunk: &MessageChunk) {
//!         print!("{}", chunk.answer.as_deref().unwrap_or_default());
//!     }
//! }
//!
//! let client = DifyClient::from_env()?;
//! let result = client
//!     .stream(
//!         &StreamRequest::chat("What is Rust?", "user-1"),
//!         StreamOptions::default(),
//!     )?
//!     .process(&mut Printer)?;
//!
//! println!("\nconversation: {:?}", result.conversation_id);
//! # Ok(())
//! # }
//! ```

/// Folding of events into the final run result.
pub mod aggregate;
/// Client facade: streaming runs, stop and file upload.
pub mod client;
/// Client configuration and environment loading.
pub mod config;
/// Listener trait and event routing.
pub mod dispatch;
/// Public error types.
pub mod errors;
/// Typed stream events and their payloads.
pub mod event;
/// Process-wide `tracing` subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Retry policy for obtaining a response.
pub mod retry;
/// SSE line framing.
pub mod sse;
/// Lazy event stream over a response body.
pub mod stream;
/// HTTP transport seam and the default reqwest transport.
pub mod transport;

pub use aggregate::{StreamAggregator, StreamOptions, StreamResult, process_stream};
pub use client::{AppKind, DifyClient, StreamRequest};
pub use config::ClientConfig;
pub use dispatch::{EventHandler, NoopHandler, dispatch};
pub use errors::{ApiError, DifyError};
pub use event::{
    MessageChunk, MessageEnd, MessageReplace, NodeFinished, NodeStarted, Schema, ShapeError,
    StreamErrorEvent, StreamEvent, TtsChunk, WorkflowEvent, WorkflowFinished, WorkflowStarted,
};
pub use observability::init_observability;
pub use retry::RetryPolicy;
pub use sse::{DecodeMode, Frame, RawLines, SseDecoder};
pub use stream::EventStream;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
