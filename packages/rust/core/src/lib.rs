//! Update pipeline orchestration for updaterelay.
//!
//! Producers hand records to an [`UpdateQueue`]; a single processor task
//! caches each one in FIFO order and fans it out to webhook subscribers.
//! [`UpdatePipeline`] wires the pieces together and exposes the admin
//! surface.

pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod validator;

pub use pipeline::{PipelineStats, UpdatePipeline};
pub use processor::{PipelineObserver, SilentObserver};
pub use queue::UpdateQueue;
