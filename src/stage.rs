use crate::cancel::CancellationToken;
use crate::error::{BoxError, PipelineError, Result};
use crate::message::Message;
use crate::runtime::{self, StageHandle};
use crossbeam::channel::Receiver;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Turns one input message into one output message, or fails.
///
/// Workers of a stage call `apply` concurrently, so implementations that
/// close over shared state must synchronize it themselves.
pub trait Transform<I, O>: Send + Sync + 'static {
    fn apply(&self, msg: Message<I>) -> std::result::Result<Message<O>, BoxError>;
}

impl<I, O, E, F> Transform<I, O> for F
where
    F: Fn(Message<I>) -> std::result::Result<Message<O>, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    fn apply(&self, msg: Message<I>) -> std::result::Result<Message<O>, BoxError> {
        (self)(msg).map_err(Into::into)
    }
}

/// Identity transform
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl<T: Send + 'static> Transform<T, T> for Passthrough {
    fn apply(&self, msg: Message<T>) -> std::result::Result<Message<T>, BoxError> {
        Ok(msg)
    }
}

/// Largest accepted output buffer; crossbeam allocates every slot up front
pub const MAX_OUTPUT_BUFFER: usize = 1 << 20;

/// Fixed configuration of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    /// Number of worker threads per run
    pub workers: usize,
    /// Capacity of the output stream; 0 makes every send a rendezvous
    pub output_buffer: usize,
}

impl StageConfig {
    /// Create a new stage configuration
    pub fn new(name: impl Into<String>, workers: usize, output_buffer: usize) -> Self {
        Self {
            name: name.into(),
            workers,
            output_buffer,
        }
    }

    /// Reject stages that could never drain their input (no workers) or
    /// whose output buffer is too large to allocate
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::ConfigError(format!(
                "stage '{}' needs at least one worker",
                self.name
            )));
        }
        if self.output_buffer > MAX_OUTPUT_BUFFER {
            return Err(PipelineError::ConfigError(format!(
                "stage '{}' output buffer {} exceeds the limit of {}",
                self.name, self.output_buffer, MAX_OUTPUT_BUFFER
            )));
        }
        Ok(())
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: "stage".into(),
            workers: 1,
            output_buffer: 0,
        }
    }
}

/// A named pool of workers that maps a stream of `Message<I>` to a stream of `Message<O>`.
///
/// A stage keeps no runtime state; every call to [`Stage::run`] creates its
/// own workers, output stream and cancellation scope.
pub struct Stage<I, O> {
    config: StageConfig,
    transform: Arc<dyn Transform<I, O>>,
}

impl<I, O> Stage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a new stage, validating its configuration
    pub fn new<T>(config: StageConfig, transform: T) -> Result<Self>
    where
        T: Transform<I, O>,
    {
        config.validate()?;
        Ok(Self {
            config,
            transform: Arc::new(transform),
        })
    }

    /// Start building a stage with default settings
    pub fn builder(name: impl Into<String>) -> StageBuilder<I, O> {
        StageBuilder::new(name)
    }

    /// Get the stage name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the number of workers spawned per run
    pub fn workers(&self) -> usize {
        self.config.workers
    }

    /// Get the capacity of the output stream
    pub fn output_buffer(&self) -> usize {
        self.config.output_buffer
    }

    /// Get the full configuration
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Start the worker pool on `input`.
    ///
    /// Returns the output stream and a handle that resolves to the first
    /// error of the run. The output stream closes once every worker has
    /// exited, whatever the reason. `input` must be closed by its producer
    /// and the output must be drained (or `token` cancelled), otherwise
    /// workers block forever.
    pub fn run(
        &self,
        token: &CancellationToken,
        input: Receiver<Message<I>>,
    ) -> Result<(Receiver<Message<O>>, StageHandle)> {
        runtime::spawn(
            &self.config,
            Arc::clone(&self.transform),
            token.child_token(),
            input,
        )
    }
}

impl<I, O> Clone for Stage<I, O> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<I, O> fmt::Debug for Stage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("config", &self.config).finish()
    }
}

/// Builder for [`Stage`]
pub struct StageBuilder<I, O> {
    config: StageConfig,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> StageBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a new builder for a stage called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: StageConfig {
                name: name.into(),
                ..StageConfig::default()
            },
            _types: PhantomData,
        }
    }

    /// Set the number of workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the output stream capacity
    pub fn output_buffer(mut self, capacity: usize) -> Self {
        self.config.output_buffer = capacity;
        self
    }

    /// Build the stage around `transform`
    pub fn build<T>(self, transform: T) -> Result<Stage<I, O>>
    where
        T: Transform<I, O>,
    {
        Stage::new(self.config, transform)
    }
}
