//! Concurrency Dispatcher
//!
//! Runs the bucket cross-product on a fixed pool of worker threads fed by a
//! bounded channel. Every bucket gets its own [`Session`]; workers share only
//! the read-only [`BucketContext`] and the progress counters.
//!
//! Setting the stop flag halts submission. Buckets already running finish
//! their current turn, and queued buckets are abandoned without a request.

use crate::bucket::{Bucket, BucketContext, BucketOutcome, BucketStatus};
use crate::plan::GenerationPlan;
use crate::session::{Session, SessionConfig};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Every (domain, type, round) combination, domain-major
pub fn cross_product(plan: &GenerationPlan, target: usize) -> Vec<Bucket> {
    let mut buckets = Vec::with_capacity(plan.bucket_count());
    for domain in &plan.domains {
        for ambiguity in &plan.ambiguity_types {
            for round in &plan.rounds {
                buckets.push(Bucket {
                    domain: domain.clone(),
                    ambiguity: ambiguity.clone(),
                    round_line: round.line.clone(),
                    round_count: round.count,
                    target,
                });
            }
        }
    }
    buckets
}

/// Shared progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub submitted: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Interrupted mid-run or abandoned in the queue
    pub interrupted: usize,
}

/// One finished bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketReport {
    pub bucket: String,
    pub outcome: BucketOutcome,
}

/// Result of a dispatch run
#[derive(Debug, Clone)]
pub struct DispatchSummary {
    pub progress: Progress,
    /// Finished buckets in plan order
    pub reports: Vec<BucketReport>,
    pub elapsed: Duration,
    pub stopped: bool,
}

impl DispatchSummary {
    pub fn failed_buckets(&self) -> impl Iterator<Item = &BucketReport> {
        self.reports
            .iter()
            .filter(|r| r.outcome.status == BucketStatus::Failed)
    }
}

/// Fixed-size worker pool over buckets
pub struct Dispatcher {
    context: BucketContext,
    session_config: SessionConfig,
    system_instruction: String,
    workers: usize,
    stop: Arc<AtomicBool>,
    progress: Mutex<Progress>,
    reports: Mutex<Vec<(usize, BucketReport)>>,
}

impl Dispatcher {
    /// `workers` below 2 runs buckets one at a time on the calling thread
    pub fn new(
        context: BucketContext,
        session_config: SessionConfig,
        system_instruction: impl Into<String>,
        workers: usize,
    ) -> Self {
        Self {
            context,
            session_config,
            system_instruction: system_instruction.into(),
            workers: workers.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            progress: Mutex::new(Progress::default()),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Flag that stops submission when set, e.g. from a signal handler
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn progress(&self) -> Progress {
        *self.progress.lock()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn run(&self, buckets: Vec<Bucket>) -> DispatchSummary {
        let started = Instant::now();
        {
            let mut progress = self.progress.lock();
            *progress = Progress {
                total: buckets.len(),
                ..Progress::default()
            };
        }
        self.reports.lock().clear();

        info!(buckets = buckets.len(), workers = self.workers, "dispatching");

        if self.workers == 1 {
            for (index, bucket) in buckets.into_iter().enumerate() {
                if self.stopped() {
                    break;
                }
                self.progress.lock().submitted += 1;
                self.execute(index, &bucket);
            }
        } else {
            self.run_pool(buckets);
        }

        let mut reports: Vec<(usize, BucketReport)> = std::mem::take(&mut *self.reports.lock());
        reports.sort_by_key(|(index, _)| *index);

        let summary = DispatchSummary {
            progress: self.progress(),
            reports: reports.into_iter().map(|(_, r)| r).collect(),
            elapsed: started.elapsed(),
            stopped: self.stopped(),
        };
        info!(
            completed = summary.progress.completed,
            succeeded = summary.progress.succeeded,
            failed = summary.progress.failed,
            interrupted = summary.progress.interrupted,
            elapsed_secs = summary.elapsed.as_secs(),
            "dispatch finished"
        );
        summary
    }

    fn run_pool(&self, buckets: Vec<Bucket>) {
        let (tx, rx) = bounded::<(usize, Bucket)>(self.workers);

        thread::scope(|scope| {
            for worker in 0..self.workers {
                let rx = rx.clone();
                scope.spawn(move || {
                    for (index, bucket) in rx.iter() {
                        if self.stopped() {
                            self.progress.lock().interrupted += 1;
                            continue;
                        }
                        tracing::debug!(worker, bucket = %bucket, "picked up bucket");
                        self.execute(index, &bucket);
                    }
                });
            }
            drop(rx);

            for (index, bucket) in buckets.into_iter().enumerate() {
                if self.stopped() {
                    info!("stop requested, no further buckets will be submitted");
                    break;
                }
                self.progress.lock().submitted += 1;
                if tx.send((index, bucket)).is_err() {
                    self.progress.lock().submitted -= 1;
                    break;
                }
            }
            drop(tx);
        });
    }

    /// Run one bucket on a fresh session, isolating panics
    fn execute(&self, index: usize, bucket: &Bucket) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut session =
                Session::new(self.session_config.clone(), self.system_instruction.clone());
            self.context.run(&mut session, bucket, &self.stop)
        }));

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(bucket = %bucket, "bucket worker panicked");
                BucketOutcome {
                    status: BucketStatus::Failed,
                    count: bucket.store(&self.context.output_dir).count(),
                    target: bucket.target,
                    calls: 0,
                    rollovers: 0,
                }
            }
        };

        let snapshot = {
            let mut progress = self.progress.lock();
            progress.completed += 1;
            match outcome.status {
                BucketStatus::Skipped | BucketStatus::Done => progress.succeeded += 1,
                BucketStatus::Failed => progress.failed += 1,
                BucketStatus::Interrupted => progress.interrupted += 1,
            }
            *progress
        };
        info!(
            bucket = %bucket,
            status = ?outcome.status,
            count = outcome.count,
            "[{}/{}] bucket finished",
            snapshot.completed,
            snapshot.total
        );

        self.reports.lock().push((
            index,
            BucketReport {
                bucket: bucket.to_string(),
                outcome,
            },
        ));
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}
