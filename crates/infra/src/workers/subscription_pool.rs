use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use custos_events::{Delivery, NackAction, PersistentSubscription, SubscriptionError, SubscriptionSource};

use crate::config::SubscriptionConfig;
use crate::projections::EventHandler;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker {worker} could not join the consumer group: {source}")]
    Connect {
        worker: usize,
        #[source]
        source: SubscriptionError,
    },

    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("subscription dropped on worker {worker}: {reason}")]
    SubscriptionDropped { worker: usize, reason: String },

    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

/// Settlement counters shared by every worker of a pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    acked: AtomicU64,
    parked: AtomicU64,
    internal: AtomicU64,
}

impl PoolStats {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn parked(&self) -> u64 {
        self.parked.load(Ordering::Relaxed)
    }

    /// Internal-stream events acknowledged without projection.
    pub fn internal(&self) -> u64 {
        self.internal.load(Ordering::Relaxed)
    }
}

/// Cancels a running pool from another thread.
#[derive(Debug, Clone)]
pub struct PoolCanceller(Arc<AtomicBool>);

impl PoolCanceller {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type WorkerExit = (usize, Result<(), PoolError>);

/// Sends a worker's exit to the supervisor when dropped, so a worker that dies
/// by panic is reported like one whose subscription dropped.
struct ExitReport {
    worker: usize,
    tx: mpsc::Sender<WorkerExit>,
    result: Option<Result<(), PoolError>>,
}

impl Drop for ExitReport {
    fn drop(&mut self) {
        let result = self
            .result
            .take()
            .unwrap_or(Err(PoolError::WorkerPanicked { worker: self.worker }));
        let _ = self.tx.send((self.worker, result));
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    cancel: PoolCanceller,
    workers: Vec<(usize, thread::JoinHandle<()>)>,
    exits: mpsc::Receiver<WorkerExit>,
    stats: Arc<PoolStats>,
}

impl PoolHandle {
    pub fn canceller(&self) -> PoolCanceller {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Supervise the pool until it stops.
    ///
    /// Returns when every worker exited. The first worker that fails cancels the
    /// others, and its failure is returned.
    pub fn wait(mut self) -> Result<(), PoolError> {
        let mut first_failure = None;
        for _ in 0..self.workers.len() {
            let Ok((worker, result)) = self.exits.recv() else {
                break;
            };
            if let Err(err) = result {
                if first_failure.is_none() {
                    error!(worker, error = %err, "worker stopped, cancelling pool");
                    self.cancel.cancel();
                    first_failure = Some(err);
                }
            }
        }
        let joined = self.join_all();
        match first_failure {
            Some(err) => Err(err),
            None => joined,
        }
    }

    /// Cancel every worker and wait for them to stop.
    pub fn shutdown(mut self) -> Result<(), PoolError> {
        self.cancel.cancel();
        let joined = self.join_all();
        while let Ok((_, result)) = self.exits.try_recv() {
            result?;
        }
        joined
    }

    fn join_all(&mut self) -> Result<(), PoolError> {
        let mut result = Ok(());
        for (worker, join) in self.workers.drain(..) {
            if join.join().is_err() && result.is_ok() {
                result = Err(PoolError::WorkerPanicked { worker });
            }
        }
        result
    }
}

fn dropped(worker: usize, err: SubscriptionError) -> PoolError {
    let reason = match err {
        SubscriptionError::Dropped(reason) => reason,
        other => other.to_string(),
    };
    PoolError::SubscriptionDropped { worker, reason }
}

/// Pool of workers sharing one durable consumer group.
///
/// Every worker pulls deliveries serially and hands them to the router:
/// - internal-stream events are acknowledged without projection
/// - a projected event is acknowledged
/// - a failed or panicking projection is parked and the worker moves on
///
/// A dropped subscription stops the whole pool.
#[derive(Debug)]
pub struct SubscriptionPool;

impl SubscriptionPool {
    pub fn start(
        source: Arc<dyn SubscriptionSource>,
        handler: Arc<dyn EventHandler>,
        config: &SubscriptionConfig,
    ) -> Result<PoolHandle, PoolError> {
        let cancel = PoolCanceller(Arc::new(AtomicBool::new(false)));
        let stats = Arc::new(PoolStats::default());
        let (exit_tx, exits) = mpsc::channel();

        let mut handle = PoolHandle {
            cancel: cancel.clone(),
            workers: Vec::with_capacity(config.pool_size),
            exits,
            stats: Arc::clone(&stats),
        };

        for worker in 0..config.pool_size.max(1) {
            let subscription = match source.connect(&config.group_name, worker) {
                Ok(s) => s,
                Err(err) => {
                    cancel.cancel();
                    let _ = handle.join_all();
                    return Err(PoolError::Connect { worker, source: err });
                }
            };
            let ctx = WorkerContext {
                worker,
                subscription,
                handler: Arc::clone(&handler),
                cancel: cancel.clone(),
                stats: Arc::clone(&stats),
                timeout: config.receive_timeout,
            };
            let exit_tx = exit_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{worker}", config.group_name))
                .spawn(move || {
                    let mut exit = ExitReport {
                        worker,
                        tx: exit_tx,
                        result: None,
                    };
                    exit.result = Some(ctx.run().map_err(|err| dropped(worker, err)));
                });
            match spawned {
                Ok(join) => handle.workers.push((worker, join)),
                Err(err) => {
                    cancel.cancel();
                    let _ = handle.join_all();
                    return Err(PoolError::Spawn { worker, source: err });
                }
            }
        }

        info!(group = %config.group_name, workers = handle.workers.len(), "subscription pool started");
        Ok(handle)
    }
}

struct WorkerContext {
    worker: usize,
    subscription: Box<dyn PersistentSubscription>,
    handler: Arc<dyn EventHandler>,
    cancel: PoolCanceller,
    stats: Arc<PoolStats>,
    timeout: Duration,
}

impl WorkerContext {
    fn run(&self) -> Result<(), SubscriptionError> {
        while !self.cancel.is_cancelled() {
            match self.subscription.receive(self.timeout)? {
                Some(delivery) => self.process(&delivery),
                None => continue,
            }
        }
        debug!(worker = self.worker, "worker cancelled");
        Ok(())
    }

    fn process(&self, delivery: &Delivery) {
        let event = &delivery.event;
        if event.is_internal() {
            self.settle(delivery, self.subscription.ack(delivery), &self.stats.internal);
            return;
        }

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(event))) {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(payload) => Err(format!("handler panicked: {}", panic_message(payload.as_ref()))),
        };

        match outcome {
            Ok(()) => self.settle(delivery, self.subscription.ack(delivery), &self.stats.acked),
            Err(reason) => {
                error!(
                    worker = self.worker,
                    event_id = %event.event_id,
                    stream = %event.stream_id,
                    event_type = %event.event_type,
                    tenant = %event.metadata.tenant,
                    causation_id = ?event.metadata.causation_id,
                    retry_count = delivery.retry_count,
                    error = %reason,
                    "projection failed, parking event"
                );
                self.settle(
                    delivery,
                    self.subscription.nack(delivery, &reason, NackAction::Park),
                    &self.stats.parked,
                );
            }
        }
    }

    /// A failed settle leaves the delivery unsettled. The in-memory hub keeps it in
    /// flight until the group is dropped; Redis keeps it pending until it is claimed
    /// after the pending timeout.
    fn settle(&self, delivery: &Delivery, result: Result<(), SubscriptionError>, counter: &AtomicU64) {
        match result {
            Ok(()) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => warn!(
                worker = self.worker,
                delivery_id = %delivery.delivery_id,
                error = %err,
                "failed to settle delivery"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
