//! Common imports for typical client usage.
pub use crate::{
    AppKind, ClientConfig, DecodeMode, DifyClient, DifyError, EventHandler, EventStream,
    MessageChunk, NodeFinished, RetryPolicy, Schema, StreamEvent, StreamOptions, StreamRequest,
    StreamResult, WorkflowFinished,
};
