//! Worker pool behind [`Stage::run`](crate::Stage::run).
//!
//! One run owns: the output channel, `workers` worker threads competing for
//! the shared input, a child cancellation scope, a first-error slot, and a
//! coordinator thread. The coordinator joins every worker before it drops
//! the last output sender, so the output stream closes exactly once and
//! only after no worker can send on it again.

use crate::cancel::{CancelReason, CancellationToken};
use crate::error::{PipelineError, Result};
use crate::message::Message;
use crate::metrics::StageMetrics;
use crate::stage::{StageConfig, Transform};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Holds the first error of a run; later ones are dropped
#[derive(Debug, Default)]
pub(crate) struct ErrorSlot {
    first: Mutex<Option<PipelineError>>,
}

impl ErrorSlot {
    /// Returns true if `err` became the recorded error
    pub(crate) fn record(&self, err: PipelineError) -> bool {
        let mut first = self.first.lock();
        if first.is_some() {
            return false;
        }
        *first = Some(err);
        true
    }

    pub(crate) fn take(&self) -> Option<PipelineError> {
        self.first.lock().take()
    }
}

struct Worker<I, O> {
    stage: Arc<str>,
    index: usize,
    transform: Arc<dyn Transform<I, O>>,
    input: Receiver<Message<I>>,
    output: Sender<Message<O>>,
    scope: CancellationToken,
    errors: Arc<ErrorSlot>,
    metrics: StageMetrics,
}

impl<I, O> Worker<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn run(self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process()));
        let err = match outcome {
            Ok(Ok(())) => {
                debug!(stage = %self.stage, worker = self.index, "worker finished");
                return;
            }
            Ok(Err(err)) => err,
            Err(_) => PipelineError::ThreadError(format!(
                "[{}]: worker {} panicked",
                self.stage, self.index
            )),
        };

        if self.errors.record(err) {
            warn!(stage = %self.stage, worker = self.index, "stage run failed, cancelling siblings");
        }
        self.scope.cancel();
        debug!(stage = %self.stage, worker = self.index, "worker stopped");
    }

    fn process(&self) -> Result<()> {
        let done = self.scope.done();
        loop {
            if self.scope.is_cancelled() {
                return Err(self.cancelled());
            }

            let msg = select! {
                recv(self.input) -> msg => match msg {
                    Ok(msg) => msg,
                    Err(_) => return Ok(()),
                },
                recv(done) -> _ => return Err(self.cancelled()),
            };
            self.metrics.record_received();
            let id = msg.id;
            trace!(stage = %self.stage, worker = self.index, id, "processing message");

            let start = Instant::now();
            let out = match self.transform.apply(msg) {
                Ok(out) => out,
                Err(source) => {
                    self.metrics.record_failed();
                    return Err(PipelineError::Transform {
                        stage: self.stage.to_string(),
                        source,
                    });
                }
            };
            self.metrics.record_latency(start.elapsed());

            if self.scope.is_cancelled() {
                return Err(self.cancelled());
            }

            select! {
                send(self.output, out) -> res => {
                    if res.is_err() {
                        return Err(PipelineError::OutputClosed {
                            stage: self.stage.to_string(),
                        });
                    }
                    self.metrics.record_emitted();
                }
                recv(done) -> _ => return Err(self.cancelled()),
            }
        }
    }

    fn cancelled(&self) -> PipelineError {
        PipelineError::Cancelled {
            stage: self.stage.to_string(),
            reason: self.scope.reason().unwrap_or(CancelReason::Cancelled),
        }
    }
}

/// Spawn the workers and coordinator for one run of a stage
pub(crate) fn spawn<I, O>(
    config: &StageConfig,
    transform: Arc<dyn Transform<I, O>>,
    scope: CancellationToken,
    input: Receiver<Message<I>>,
) -> Result<(Receiver<Message<O>>, StageHandle)>
where
    I: Send + 'static,
    O: Send + 'static,
{
    config.validate()?;

    let stage: Arc<str> = Arc::from(config.name.as_str());
    let (output_tx, output_rx) = channel::bounded(config.output_buffer);
    let errors = Arc::new(ErrorSlot::default());
    let metrics = StageMetrics::new();

    debug!(
        stage = %stage,
        workers = config.workers,
        output_buffer = config.output_buffer,
        "starting stage run"
    );

    let mut workers = Vec::with_capacity(config.workers);
    for index in 0..config.workers {
        let worker = Worker {
            stage: Arc::clone(&stage),
            index,
            transform: Arc::clone(&transform),
            input: input.clone(),
            output: output_tx.clone(),
            scope: scope.clone(),
            errors: Arc::clone(&errors),
            metrics: metrics.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("{stage}-worker-{index}"))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(err) => {
                // Workers already started see the cancelled scope and exit on their own
                scope.cancel();
                return Err(PipelineError::ThreadError(format!(
                    "[{stage}]: failed to spawn worker {index}: {err}"
                )));
            }
        }
    }
    drop(input);

    let (finished_tx, finished_rx) = channel::bounded::<()>(0);
    let coordinator = {
        let stage = Arc::clone(&stage);
        let errors = Arc::clone(&errors);
        let scope = scope.clone();
        thread::Builder::new()
            .name(format!("{stage}-coordinator"))
            .spawn(move || {
                let _finished = finished_tx;
                for (index, worker) in workers.into_iter().enumerate() {
                    if worker.join().is_err() {
                        errors.record(PipelineError::ThreadError(format!(
                            "[{stage}]: worker {index} could not be joined"
                        )));
                        scope.cancel();
                    }
                }
                drop(output_tx);
                debug!(stage = %stage, "all workers exited, output stream closed");
            })
    };
    let coordinator = match coordinator {
        Ok(handle) => handle,
        Err(err) => {
            scope.cancel();
            return Err(PipelineError::ThreadError(format!(
                "[{stage}]: failed to spawn coordinator: {err}"
            )));
        }
    };

    let handle = StageHandle {
        stage,
        coordinator,
        finished: finished_rx,
        errors,
        scope,
        metrics,
    };
    Ok((output_rx, handle))
}

/// Completion handle of one stage run.
///
/// Resolves once every worker has exited and the output stream is closed.
/// It should always be waited on; the first error of the run is only
/// reported here.
#[must_use = "a stage run reports its errors only through its handle"]
#[derive(Debug)]
pub struct StageHandle {
    stage: Arc<str>,
    coordinator: JoinHandle<()>,
    finished: Receiver<()>,
    errors: Arc<ErrorSlot>,
    scope: CancellationToken,
    metrics: StageMetrics,
}

impl StageHandle {
    pub fn name(&self) -> &str {
        &self.stage
    }

    /// Live metrics of this run
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// True once all workers exited and the output stream is closed
    pub fn is_finished(&self) -> bool {
        self.coordinator.is_finished()
    }

    /// Cancel this run only; other stages sharing the caller's token keep going
    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// Block until the run completes and return its first error
    pub fn wait(self) -> Result<()> {
        if self.coordinator.join().is_err() {
            return Err(PipelineError::ThreadError(format!(
                "[{}]: coordinator panicked",
                self.stage
            )));
        }
        match self.errors.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    ///
    /// On timeout the run keeps going in the background; only the handle is gone.
    pub fn wait_timeout(self, timeout: Duration) -> Result<()> {
        match self.finished.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::Timeout {
                stage: self.stage.to_string(),
            }),
            _ => self.wait(),
        }
    }
}

/// Wait on every handle, then return the first error in handle order
pub fn wait_all<H>(handles: H) -> Result<()>
where
    H: IntoIterator<Item = StageHandle>,
{
    let mut first = None;
    for handle in handles {
        if let Err(err) = handle.wait() {
            first.get_or_insert(err);
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
