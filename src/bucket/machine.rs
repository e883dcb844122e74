//! Bucket Completion Loop
//!
//! ```text
//! START ──(have ≥ target)──────────────────────────────► DONE
//!   │
//!   ▼
//! GENERATE ──(send failed)──► GENERATE
//!   │
//!   ▼
//! SUPPLEMENT ◄──┐  continuation, or a full instruction after rollover
//!   │  │        │
//!   │  └────────┘  while have < target and retries remain
//!   ├──(have ≥ target)──► DONE
//!   └──(retries spent)──► FAILED ──► incomplete log
//! ```
//!
//! A retry is spent on every turn that adds nothing: transport failure,
//! nothing extractable, or nothing valid. The counter resets whenever a turn
//! adds records. The session is reset on every exit, and if any request was
//! made a cooldown runs before the caller gets its slot back.

use super::{Bucket, InstructionBuilder};
use crate::client::{ClientError, CompletionBackend};
use crate::config::DialogenConfig;
use crate::extract::Extractor;
use crate::session::{OutputPlan, Session};
use crate::store::{IncompleteLog, RecordStore, StoreError};
use crate::validate::Validator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Output budget multiplier applied after reasoning exhausts a request
const EXHAUSTION_BOOST: f64 = 1.5;

/// Granularity of interruptible sleeps
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Where a bucket is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Start,
    Generate,
    Supplement,
    Done,
    Failed,
    Interrupted,
}

/// How a bucket ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// Store already held the target on arrival
    Skipped,
    Done,
    /// Retries ran out below target
    Failed,
    /// Stopped by an interrupt below target
    Interrupted,
}

impl BucketStatus {
    pub fn is_success(self) -> bool {
        matches!(self, BucketStatus::Skipped | BucketStatus::Done)
    }
}

/// Result of one bucket run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOutcome {
    pub status: BucketStatus,
    pub count: usize,
    pub target: usize,
    /// Requests sent to the backend
    pub calls: usize,
    pub rollovers: usize,
}

/// Retry and pacing knobs
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub cooldown: Duration,
    pub rollover_delay: Duration,
    pub dump_unparsed: bool,
}

impl LoopSettings {
    pub fn from_config(config: &DialogenConfig) -> Self {
        let g = &config.generation;
        Self {
            max_retries: g.max_retries,
            retry_delay: Duration::from_secs(g.retry_delay_secs),
            cooldown: Duration::from_secs(g.cooldown_secs),
            rollover_delay: Duration::from_secs(g.rollover_delay_secs),
            dump_unparsed: g.dump_unparsed,
        }
    }

    /// No delays; for tests and dry runs
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::ZERO,
            cooldown: Duration::ZERO,
            rollover_delay: Duration::ZERO,
            dump_unparsed: false,
        }
    }
}

/// Why a turn added no records
#[derive(Debug)]
enum TurnFailure {
    Client(ClientError),
    NothingExtracted,
    NothingValid { rejected: usize },
    Store(StoreError),
}

/// Everything a bucket run needs besides its session. Shared read-only
/// across workers.
pub struct BucketContext {
    pub backend: Arc<dyn CompletionBackend>,
    pub extractor: Extractor,
    pub validator: Validator,
    pub instructions: InstructionBuilder,
    pub settings: LoopSettings,
    pub output_dir: PathBuf,
    pub incomplete_log: IncompleteLog,
}

impl BucketContext {
    pub fn from_config(config: &DialogenConfig, backend: Arc<dyn CompletionBackend>) -> Self {
        let g = &config.generation;
        Self {
            backend,
            extractor: Extractor::new(g.identifying_field.clone()),
            validator: Validator::new(g.identifying_field.clone(), g.summary_marker.clone()),
            instructions: InstructionBuilder::new(g.summary_marker.clone()),
            settings: LoopSettings::from_config(config),
            output_dir: g.output_dir.clone(),
            incomplete_log: IncompleteLog::in_dir(&g.output_dir),
        }
    }

    /// Drive `bucket` to its target through `session`.
    ///
    /// `stop` is checked between turns; a turn already in flight completes
    /// and its records are kept.
    pub fn run(&self, session: &mut Session, bucket: &Bucket, stop: &AtomicBool) -> BucketOutcome {
        session.reset();
        let store = bucket.store(&self.output_dir);

        let mut run = Run {
            have: store.count(),
            calls: 0,
            retries: 0,
            rollovers: 0,
            boost: 1.0,
        };
        let mut state = BucketState::Start;

        loop {
            state = match state {
                BucketState::Start => {
                    if run.have >= bucket.target {
                        info!(bucket = %bucket, have = run.have, target = bucket.target, "already complete, skipping");
                        BucketState::Done
                    } else {
                        info!(bucket = %bucket, have = run.have, target = bucket.target, "starting bucket");
                        BucketState::Generate
                    }
                }
                BucketState::Generate => {
                    let plan = self.plan(session, bucket, &run);
                    let message = self.instructions.generation(bucket, plan.needed);
                    let max_tokens = run.boosted(plan.max_tokens, session);
                    info!(bucket = %bucket, needed = plan.needed, max_tokens, "sending generation instruction");

                    let result = self.turn(session, bucket, &store, &message, max_tokens);
                    let sent = !matches!(result, Err(TurnFailure::Client(_)));
                    self.settle(bucket, &mut run, result);
                    match self.next_state(&run, bucket, stop) {
                        BucketState::Supplement if !sent => {
                            self.pause(self.settings.retry_delay, stop);
                            BucketState::Generate
                        }
                        BucketState::Supplement if run.retries > 0 => {
                            self.pause(self.settings.retry_delay, stop);
                            BucketState::Supplement
                        }
                        next => next,
                    }
                }
                BucketState::Supplement => {
                    let plan = self.plan(session, bucket, &run);
                    let max_tokens = run.boosted(plan.max_tokens, session);
                    let continuation = self.instructions.continuation(run.have, plan.needed);

                    let message = if session.ensure_ready(&continuation, max_tokens) {
                        run.rollovers += 1;
                        info!(bucket = %bucket, needed = plan.needed, "rolled over, resending full instruction");
                        self.pause(self.settings.rollover_delay, stop);
                        self.instructions.generation(bucket, plan.needed)
                    } else {
                        info!(bucket = %bucket, needed = plan.needed, max_tokens, "requesting remaining records");
                        continuation
                    };

                    let result = self.turn(session, bucket, &store, &message, max_tokens);
                    self.settle(bucket, &mut run, result);
                    let next = self.next_state(&run, bucket, stop);
                    if next == BucketState::Supplement && run.retries > 0 {
                        self.pause(self.settings.retry_delay, stop);
                    }
                    next
                }
                BucketState::Done | BucketState::Failed | BucketState::Interrupted => break,
            };
        }

        let status = match state {
            BucketState::Done if run.calls == 0 => BucketStatus::Skipped,
            BucketState::Done => BucketStatus::Done,
            BucketState::Interrupted => BucketStatus::Interrupted,
            _ => BucketStatus::Failed,
        };

        match status {
            BucketStatus::Done => {
                info!(bucket = %bucket, count = run.have, calls = run.calls, "bucket complete")
            }
            BucketStatus::Failed => {
                warn!(bucket = %bucket, count = run.have, target = bucket.target, "retries exhausted");
                if let Err(e) = self.incomplete_log.record(
                    &bucket.domain.code,
                    &bucket.ambiguity.code,
                    bucket.round_count,
                    run.have,
                    bucket.target,
                ) {
                    error!(bucket = %bucket, error = %e, "failed to write incomplete log");
                }
            }
            BucketStatus::Interrupted => {
                info!(bucket = %bucket, count = run.have, target = bucket.target, "interrupted")
            }
            BucketStatus::Skipped => {}
        }

        session.reset();
        if run.calls > 0 {
            self.pause(self.settings.cooldown, stop);
        }

        BucketOutcome {
            status,
            count: run.have,
            target: bucket.target,
            calls: run.calls,
            rollovers: run.rollovers,
        }
    }

    fn plan(&self, session: &Session, bucket: &Bucket, run: &Run) -> OutputPlan {
        let needed = bucket.target.saturating_sub(run.have);
        let plan = session.plan_output(bucket.round_count, needed);
        if plan.shrunk {
            info!(
                bucket = %bucket,
                requested = needed,
                adjusted = plan.needed,
                "output estimate over cap, asking for fewer records"
            );
        }
        plan
    }

    fn next_state(&self, run: &Run, bucket: &Bucket, stop: &AtomicBool) -> BucketState {
        if run.have >= bucket.target {
            BucketState::Done
        } else if run.retries >= self.settings.max_retries {
            BucketState::Failed
        } else if stop.load(Ordering::SeqCst) {
            BucketState::Interrupted
        } else {
            BucketState::Supplement
        }
    }

    /// One send, extract, validate, append cycle. Returns the new store count.
    fn turn(
        &self,
        session: &mut Session,
        bucket: &Bucket,
        store: &RecordStore,
        message: &str,
        max_tokens: usize,
    ) -> Result<usize, TurnFailure> {
        let reply = session
            .send(self.backend.as_ref(), message, max_tokens)
            .map_err(TurnFailure::Client)?;

        let Some(extracted) = self.extractor.extract(&reply.text) else {
            if self.settings.dump_unparsed {
                match store.dump_raw(&reply.text) {
                    Ok(path) => debug!(path = %path.display(), "saved unparsed response"),
                    Err(e) => warn!(error = %e, "failed to save unparsed response"),
                }
            }
            return Err(TurnFailure::NothingExtracted);
        };

        let candidates = extracted.records.len();
        let partition = self.validator.partition(extracted.records, bucket.round_count);
        for invalid in &partition.reasons {
            debug!(bucket = %bucket, index = invalid.index, reason = %invalid.reason, "dropped record");
        }
        if partition.valid.is_empty() {
            return Err(TurnFailure::NothingValid {
                rejected: partition.rejected,
            });
        }

        let total = store.append(&partition.valid).map_err(TurnFailure::Store)?;
        info!(
            bucket = %bucket,
            candidates,
            valid = partition.valid.len(),
            rejected = partition.rejected,
            total,
            "appended records"
        );
        Ok(total)
    }

    fn settle(&self, bucket: &Bucket, run: &mut Run, result: Result<usize, TurnFailure>) {
        run.calls += 1;
        match result {
            Ok(total) => {
                run.have = total;
                run.retries = 0;
                run.boost = 1.0;
            }
            Err(failure) => {
                run.retries += 1;
                match failure {
                    TurnFailure::Client(e) => {
                        if e.is_budget_exhausted() {
                            run.boost *= EXHAUSTION_BOOST;
                        }
                        warn!(bucket = %bucket, retries = run.retries, error = %e, "request failed");
                    }
                    TurnFailure::NothingExtracted => {
                        warn!(bucket = %bucket, retries = run.retries, "no records found in response")
                    }
                    TurnFailure::NothingValid { rejected } => {
                        warn!(bucket = %bucket, retries = run.retries, rejected, "no valid records in response")
                    }
                    TurnFailure::Store(e) => {
                        error!(bucket = %bucket, retries = run.retries, error = %e, "failed to append records")
                    }
                }
            }
        }
    }

    /// Sleep for `duration`, returning early once `stop` is set
    fn pause(&self, duration: Duration, stop: &AtomicBool) {
        if duration.is_zero() {
            return;
        }
        let deadline = Instant::now() + duration;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }
}

/// Mutable bookkeeping for one bucket run
struct Run {
    have: usize,
    calls: usize,
    retries: u32,
    rollovers: usize,
    boost: f64,
}

impl Run {
    /// Apply the exhaustion boost, never past the variant's cap
    fn boosted(&self, max_tokens: usize, session: &Session) -> usize {
        let cap = session.budget().output_cap(session.variant());
        ((max_tokens as f64 * self.boost) as usize).min(cap.max(max_tokens))
    }
}
