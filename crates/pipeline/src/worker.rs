//! Bounded worker pool: lease → process → reconcile → acknowledge/fail.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use cropcart_core::WorkerId;
use cropcart_queue::{FailOutcome, JobQueue, LeasedJob, QueueError};
use cropcart_storage::{ObjectStorage, ProductStore};

use crate::config::PipelineConfig;
use crate::processor::ImageProcessor;
use crate::reconciler::{ReconcileError, Reconciler};

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_discarded: u64,
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdowns: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for every worker to stop. Workers
    /// finish the job they hold; nothing in flight is abandoned. Returns
    /// the final statistics, complete because every worker has joined.
    pub fn shutdown(self) -> PoolStats {
        let WorkerPoolHandle {
            shutdowns,
            joins,
            stats,
        } = self;
        for tx in &shutdowns {
            let _ = tx.send(());
        }
        for join in joins {
            let _ = join.join();
        }
        stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// What a single lease cycle did with its job.
enum Disposition {
    Acknowledged,
    Retried,
    DeadLettered,
    /// Acknowledged without reconciling (missing product, stale lease).
    Discarded,
}

/// Fixed-concurrency consumer pool over a shared job queue.
///
/// Exactly `worker_concurrency` jobs are leased and in flight at once.
/// Workers share no mutable state with each other except through the
/// queue; each holds its own clones of the queue client and stores
/// (dependency injection, no globals).
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn<Q, P, S>(
        queue: Q,
        products: P,
        storage: S,
        config: PipelineConfig,
    ) -> WorkerPoolHandle
    where
        Q: JobQueue + Clone + Send + 'static,
        P: ProductStore + Clone + Send + 'static,
        S: ObjectStorage + Clone + Send + 'static,
    {
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let mut shutdowns = Vec::with_capacity(config.worker_concurrency);
        let mut joins = Vec::with_capacity(config.worker_concurrency);

        for index in 0..config.worker_concurrency {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            shutdowns.push(shutdown_tx);

            let worker = Worker {
                worker_id: WorkerId::new(),
                queue: queue.clone(),
                products: products.clone(),
                processor: ImageProcessor::new(storage.clone(), config.upload_folder.clone()),
                reconciler: Reconciler::new(products.clone(), storage.clone()),
            };
            let poll_interval = config.poll_interval;
            let stats = stats.clone();

            let join = thread::Builder::new()
                .name(format!("image-worker-{index}"))
                .spawn(move || worker.run(shutdown_rx, poll_interval, stats))
                .expect("failed to spawn image worker thread");
            joins.push(join);
        }

        info!(workers = config.worker_concurrency, "worker pool started");

        WorkerPoolHandle {
            shutdowns,
            joins,
            stats,
        }
    }
}

struct Worker<Q, P, S> {
    worker_id: WorkerId,
    queue: Q,
    products: P,
    processor: ImageProcessor<S>,
    reconciler: Reconciler<P, S>,
}

impl<Q, P, S> Worker<Q, P, S>
where
    Q: JobQueue,
    P: ProductStore,
    S: ObjectStorage,
{
    fn run(
        &self,
        shutdown_rx: mpsc::Receiver<()>,
        poll_interval: std::time::Duration,
        stats: Arc<Mutex<PoolStats>>,
    ) {
        info!(worker_id = %self.worker_id, "image worker started");

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            match self.queue.lease(&self.worker_id) {
                Ok(Some(leased)) => {
                    let disposition = self.handle_lease(leased);
                    if let Ok(mut s) = stats.lock() {
                        s.jobs_processed += 1;
                        match disposition {
                            Disposition::Acknowledged => s.jobs_succeeded += 1,
                            Disposition::Retried => s.jobs_retried += 1,
                            Disposition::DeadLettered => s.jobs_dead_lettered += 1,
                            Disposition::Discarded => s.jobs_discarded += 1,
                        }
                    }
                }
                Ok(None) => thread::sleep(poll_interval),
                Err(err) => {
                    error!(worker_id = %self.worker_id, error = %err, "lease failed");
                    thread::sleep(poll_interval);
                }
            }
        }

        info!(worker_id = %self.worker_id, "image worker stopped");
    }

    /// One full lease cycle. Per-file failures are absorbed into the
    /// outcome; only reconciler store failures (and total-failure attempts)
    /// fail the whole envelope and make it eligible for retry.
    fn handle_lease(&self, leased: LeasedJob) -> Disposition {
        let LeasedJob {
            envelope,
            lease_token,
        } = leased;
        let job_id = envelope.job_id;
        let started = Instant::now();

        debug!(
            worker_id = %self.worker_id,
            job_id = %job_id,
            attempt = envelope.attempt,
            files = envelope.file_paths.len(),
            "leased job"
        );

        // Snapshot the product first: its image list tells us what to
        // supersede, its version anchors the conditional update.
        let product = match self.products.get(envelope.entity_id) {
            Ok(Some(product)) => product,
            Ok(None) => {
                // Concurrently deleted; retrying cannot bring it back.
                warn!(job_id = %job_id, product_id = %envelope.entity_id, "product missing, discarding job");
                self.acknowledge(job_id, &lease_token);
                return Disposition::Discarded;
            }
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "product read failed");
                return self.fail(job_id, &lease_token, &err.to_string());
            }
        };

        let is_update = !product.images().is_empty();
        let outcome =
            self.processor
                .process(&envelope, product.images().to_vec(), product.version());
        let any_success = outcome.any_success();
        let failure_summary = outcome.failure_summary();

        match self.reconciler.reconcile(envelope.entity_id, outcome, is_update) {
            Ok(()) => {
                let disposition = if any_success {
                    self.acknowledge(job_id, &lease_token);
                    Disposition::Acknowledged
                } else {
                    // Marked failed for now; the queue's retry policy
                    // decides whether another attempt happens.
                    self.fail(job_id, &lease_token, &failure_summary)
                };
                info!(
                    worker_id = %self.worker_id,
                    job_id = %job_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job finished"
                );
                disposition
            }
            Err(ReconcileError::Conflict(msg)) => {
                warn!(job_id = %job_id, reason = %msg, "reconcile conflict, discarding job");
                self.acknowledge(job_id, &lease_token);
                Disposition::Discarded
            }
            Err(ReconcileError::Store(msg)) => {
                warn!(job_id = %job_id, error = %msg, "reconcile write failed");
                self.fail(job_id, &lease_token, &msg)
            }
        }
    }

    /// Stale acknowledges are logged and ignored: another worker already
    /// owns the job.
    fn acknowledge(&self, job_id: cropcart_queue::JobId, token: &cropcart_queue::LeaseToken) {
        match self.queue.acknowledge(job_id, token) {
            Ok(()) => {}
            Err(QueueError::LeaseExpired(_)) => {
                warn!(job_id = %job_id, "acknowledge raced a lease expiry");
            }
            Err(err) => error!(job_id = %job_id, error = %err, "acknowledge failed"),
        }
    }

    fn fail(
        &self,
        job_id: cropcart_queue::JobId,
        token: &cropcart_queue::LeaseToken,
        reason: &str,
    ) -> Disposition {
        match self.queue.fail(job_id, token, reason) {
            Ok(FailOutcome::Retrying { attempt }) => {
                debug!(job_id = %job_id, attempt, "job re-queued for retry");
                Disposition::Retried
            }
            Ok(FailOutcome::DeadLettered { attempts }) => {
                warn!(job_id = %job_id, attempts, reason, "job dead-lettered");
                Disposition::DeadLettered
            }
            Err(QueueError::LeaseExpired(_)) => {
                warn!(job_id = %job_id, "fail raced a lease expiry");
                Disposition::Discarded
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "fail call failed");
                Disposition::Discarded
            }
        }
    }
}
