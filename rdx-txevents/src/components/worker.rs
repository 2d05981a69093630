//! The background pool that runs ASYNC listeners.
//!
//! Jobs are queued on a bounded channel and drained by a fixed number of
//! worker tasks. Each job runs in its own task, so a panicking handler
//! surfaces as a `JoinError` instead of taking a worker down with it.
//!
//! Shutdown closes the queue. Jobs still queued at that point, and jobs
//! submitted afterwards, are reported to the failure sink rather than run.

use crate::common::ListenerId;
use crate::components::listener::AsyncHandler;
use crate::error::ListenerError;
use crate::events::Delivery;
use crate::observer::FailureSink;
use anyhow::anyhow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, trace, warn};

/// One ASYNC delivery waiting for a worker.
#[doc(hidden)]
pub(crate) struct AsyncJob {
    pub listener_id: ListenerId,
    pub name: Arc<str>,
    pub handler: AsyncHandler,
    pub delivery: Delivery,
}

impl AsyncJob {
    fn failure(self, source: anyhow::Error) -> ListenerError {
        ListenerError {
            listener: self.name.to_string(),
            listener_id: self.listener_id,
            phase: self.delivery.phase(),
            event_type: self.delivery.event().event_type().to_string(),
            source,
        }
    }
}

/// A fixed set of worker tasks sharing one job queue.
#[doc(hidden)]
pub(crate) struct WorkerPool {
    sender: mpsc::Sender<AsyncJob>,
    shutdown_sender: broadcast::Sender<()>,
    closed: AtomicBool,
    sink: FailureSink,
}

impl WorkerPool {
    /// Spawns `workers` tasks on `handle`.
    pub(crate) fn spawn(
        handle: &Handle,
        workers: usize,
        capacity: usize,
        sink: FailureSink,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown_sender, _) = broadcast::channel(1);
        let receiver = Arc::new(Mutex::new(receiver));

        for index in 0..workers {
            let receiver = receiver.clone();
            let sink = sink.clone();
            let shutdown_rx = shutdown_sender.subscribe();
            handle.spawn(async move { worker_loop(index, receiver, sink, shutdown_rx).await });
        }
        debug!(workers, capacity, "Async worker pool started");

        Self {
            sender,
            shutdown_sender,
            closed: AtomicBool::new(false),
            sink,
        }
    }

    /// Queues a job without blocking. A full or closed queue is reported as
    /// a failure of that listener.
    pub(crate) fn submit(&self, job: AsyncJob) {
        if self.closed.load(Ordering::Acquire) {
            warn!(listener = %job.name, "Async pool stopped, delivery rejected");
            self.sink.report(job.failure(anyhow!("async worker pool has shut down")));
            return;
        }
        match self.sender.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(listener = %job.name, "Async queue full, delivery rejected");
                self.sink.report(job.failure(anyhow!("async queue is full")));
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(listener = %job.name, "Async pool stopped, delivery rejected");
                self.sink.report(job.failure(anyhow!("async worker pool has shut down")));
            }
        }
    }

    /// Signals every worker to stop after its current job. Queued jobs are
    /// reported, not run.
    pub(crate) fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if self.shutdown_sender.send(()).is_err() {
            trace!("Async workers already stopped");
        }
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<Mutex<mpsc::Receiver<AsyncJob>>>,
    sink: FailureSink,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                drain_queue(&receiver, &sink).await;
                break;
            }
            job = next_job(&receiver) => match job {
                Some(job) => job,
                None => break,
            },
        };
        run_job(job, &sink).await;
    }
    trace!(worker = index, "Async worker stopped");
}

async fn drain_queue(receiver: &Mutex<mpsc::Receiver<AsyncJob>>, sink: &FailureSink) {
    let mut receiver = receiver.lock().await;
    receiver.close();
    let mut dropped = 0usize;
    while let Ok(job) = receiver.try_recv() {
        dropped += 1;
        sink.report(job.failure(anyhow!("async worker pool shut down before the job ran")));
    }
    if dropped > 0 {
        warn!(dropped, "Async pool shut down with queued deliveries");
    }
}

async fn next_job(receiver: &Mutex<mpsc::Receiver<AsyncJob>>) -> Option<AsyncJob> {
    receiver.lock().await.recv().await
}

async fn run_job(job: AsyncJob, sink: &FailureSink) {
    if job
        .delivery
        .cancellation()
        .is_some_and(|token| token.is_cancelled())
    {
        debug!(listener = %job.name, "Caller cancelled, skipping async delivery");
        sink.report(job.failure(anyhow!("cancelled before the handler started")));
        return;
    }

    let handler = job.handler.clone();
    let delivery = job.delivery.clone();
    let result = match tokio::spawn(async move { handler(delivery).await }).await {
        Ok(result) => result,
        Err(join_error) => Err(anyhow!("handler panicked: {join_error}")),
    };

    match result {
        Ok(()) => trace!(listener = %job.name, "Async delivery complete"),
        Err(source) => sink.report(job.failure(source)),
    }
}
