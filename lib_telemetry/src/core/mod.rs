//! # Core Modules
//!
//! The ingest side of the pipeline: buffering, handler registration, topic
//! dispatch, the processing worker and the `Pipeline` coordinator.

/// Topic parsing and failure-isolated fan-out.
pub mod dispatcher;
/// Bounded ring buffer of recent raw messages.
pub mod ingest_buffer;
/// Stage wiring, lifecycle and health checks.
pub mod pipeline;
/// Single consumer of the intake channel.
pub mod processor;
/// Typed handler patterns and the ordered registration table.
pub mod registry;

pub use dispatcher::{DispatchStats, Dispatcher, Topic, TopicError};
pub use ingest_buffer::{BufferSnapshot, IngestBuffer, RawMessage};
pub use pipeline::{Pipeline, PipelineStats};
pub use processor::{Processor, ProcessorStats};
pub use registry::{Category, Handler, HandlerId, HandlerPattern, HandlerRegistry, PatternError};
