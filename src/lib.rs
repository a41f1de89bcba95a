//! Bounded, cancellable worker-pool stages for typed multi-stage pipelines.
//!
//! A [`Stage`] maps a stream of [`Message<I>`] to a stream of [`Message<O>`]
//! with a fixed number of worker threads and a bounded output buffer.
//! Stages are chained by the caller: the output receiver of one run is the
//! input of the next.
//!
//! # Features
//!
//! - Competing-consumer workers over crossbeam channels (no ordering guarantee)
//! - Bounded output buffers for backpressure; capacity 0 is a rendezvous
//! - Cooperative cancellation through a shared [`CancellationToken`] tree,
//!   with optional deadlines
//! - First-error-wins reporting through a [`StageHandle`]; one failing
//!   worker cancels its siblings
//! - Per-run metrics: counts, latency percentiles, throughput
//!
//! # Example
//!
//! ```no_run
//! use stage_pipeline::{source, CancellationToken, Message, Stage};
//!
//! # fn main() -> stage_pipeline::Result<()> {
//! let square = Stage::builder("square")
//!     .workers(3)
//!     .output_buffer(4)
//!     .build(|m: Message<i64>| Ok::<_, stage_pipeline::BoxError>(m.map(|p| p * p)))?;
//!
//! let token = CancellationToken::new();
//! let (input, _producer) = source(1..=10, 0)?;
//! let (output, handle) = square.run(&token, input)?;
//!
//! for msg in output {
//!     println!("[{}]: {}", msg.id, msg.payload);
//! }
//! handle.wait()?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod error;
pub mod message;
pub mod metrics;
pub mod runtime;
pub mod source;
pub mod stage;

pub use cancel::{CancelReason, CancellationToken};
pub use crossbeam::channel::{Receiver, Sender};
pub use error::{BoxError, PipelineError, Result};
pub use message::Message;
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use runtime::{wait_all, StageHandle};
pub use source::{source, source_with_cancel};
pub use stage::{Passthrough, Stage, StageBuilder, StageConfig, Transform, MAX_OUTPUT_BUFFER};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
