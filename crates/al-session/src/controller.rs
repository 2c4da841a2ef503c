//! Session controller: the per-sample query loop.
//!
//! One iteration per sample, strictly in arrival order:
//!
//! 1. time the iteration (real-time mode, every iteration after the first);
//!    the clock starts when the previous pacing sleep ends, so a retrain in
//!    between eats into this period
//! 2. ask the committee for its verdict and the current sample
//! 3. buffer the sample, queried or not
//! 4. score disagreement and decide whether to query
//! 5. translate votes to labels for the result log
//! 6. write the result row
//! 7. on a query: count it, lock the buffer, resolve the label
//! 8. sleep out the rest of the pacing period, or warn on overrun
//! 9. stop if the query budget is used up
//! 10. retrain when the scheduler says so
//!
//! A positive decision while a query is still in flight is dropped and
//! logged: the buffered run of samples will be labelled by that query.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use coordination::{
    AnnotationBuffer, CommitteeOracle, CsvResultSink, DisagreementEvaluator, JsonlAnnotationStore,
    Pacer, QueryProgress, ResultRow, ResultSink, RetrainOutcome, RetrainScheduler, SampleIndex,
    SharedAnnotationBuffer,
};
use tracing::{debug, error, info, warn};

use crate::config::{SessionConfig, SessionSettings};
use crate::error::{SessionError, SessionResult};
use crate::replay::ReplayCommittee;
use crate::resolution::{
    finish_query, lock_buffer, DialogueService, PendingQuery, QueryContext, QueryResolution,
    QueryResolutionStrategy,
};
use crate::telemetry::{EndReason, SessionReport};

/// Counters accumulated over the loop.
#[derive(Debug, Default)]
struct LoopStats {
    samples_processed: u64,
    suppressed_queries: u32,
    abandoned_queries: u32,
    annotated_samples: u64,
    annotation_store_failures: u32,
    result_log_failures: u32,
    committee_failures: u32,
}

/// Drives one active-learning session.
pub struct SessionController {
    settings: SessionSettings,
    committee: Box<dyn CommitteeOracle>,
    buffer: SharedAnnotationBuffer,
    evaluator: DisagreementEvaluator,
    scheduler: RetrainScheduler,
    pacer: Pacer,
    sink: Box<dyn ResultSink>,
    strategy: QueryResolutionStrategy,
    /// Confirmed queries this process (QueryRecord).
    queries: u32,
    pending: Option<PendingQuery>,
    stats: LoopStats,
    session_id: String,
    started_at: DateTime<Local>,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        committee: Box<dyn CommitteeOracle>,
        buffer: AnnotationBuffer,
        sink: Box<dyn ResultSink>,
        strategy: QueryResolutionStrategy,
    ) -> Self {
        Self {
            evaluator: DisagreementEvaluator::new(settings.metric, settings.policy),
            scheduler: RetrainScheduler::new(settings.retrain_cadence),
            pacer: Pacer::with_period(settings.real_time, settings.pacing_period),
            settings,
            committee,
            buffer: buffer.shared(),
            sink,
            strategy,
            queries: 0,
            pending: None,
            stats: LoopStats::default(),
            session_id: uuid::Uuid::new_v4().to_string(),
            started_at: Local::now(),
        }
    }

    /// Build a session from configuration: replay committee, JSONL
    /// annotation store and a CSV result log named by the start time.
    ///
    /// An unrecognised dataset fails before anything is constructed.
    pub fn from_config(
        config: &SessionConfig,
        dialogue: Option<Arc<dyn DialogueService>>,
    ) -> SessionResult<Self> {
        let dataset = config.validate()?;
        let settings = SessionSettings::from_config(config)?;
        let strategy = QueryResolutionStrategy::select(config.oracle, config.real_time, dialogue)?;

        let mut committee = ReplayCommittee::open(&config.predictions_path(dataset), dataset)
            .map_err(SessionError::Committee)?;
        if let Some(argv) = config.retrain_argv()? {
            committee = committee.with_retrain_command(argv);
        }

        let annotations = config.annotations_path(dataset);
        let store =
            JsonlAnnotationStore::open(&annotations).map_err(|source| {
                SessionError::AnnotationStore {
                    path: annotations.clone(),
                    source,
                }
            })?;

        let started_at = Local::now();
        let sink = CsvResultSink::create(&config.log_dir, started_at, committee.members())?;

        let mut controller = Self::new(
            settings,
            Box::new(committee),
            AnnotationBuffer::new(Box::new(store)),
            Box::new(sink),
            strategy,
        );
        controller.started_at = started_at;

        info!(
            session_id = %controller.session_id,
            dataset = %dataset,
            resolution = controller.strategy.name(),
            real_time = config.real_time,
            auto_retrain = config.auto_retrain,
            "Ready."
        );
        Ok(controller)
    }

    /// Confirmed queries so far.
    pub fn queries(&self) -> u32 {
        self.queries
    }

    /// Whether a background query is still awaiting its answer.
    pub fn has_pending_query(&self) -> bool {
        self.pending.is_some()
    }

    pub fn buffer(&self) -> &SharedAnnotationBuffer {
        &self.buffer
    }

    /// Run the loop to completion and report what happened.
    pub async fn run(&mut self) -> SessionResult<SessionReport> {
        let clock = Instant::now();
        self.committee.reset_counter();
        let sample_budget = self.committee.get_max_predictions();
        let limit: usize = match self.settings.max_predictions {
            0 => sample_budget,
            cap => cap.min(sample_budget),
        };
        let limit = limit as u64;

        info!(
            session_id = %self.session_id,
            samples = limit,
            query_budget = self.settings.query_budget,
            resolution = self.strategy.name(),
            "Session starting"
        );

        let mut end_reason = EndReason::SampleBudgetExhausted;
        let mut started = self.pacer.start(0);
        for i in 0..limit {
            if self.process_sample(i, limit).await? {
                self.stats.samples_processed += 1;
            }

            self.pacer.pace(started).await;
            // The next period starts now, so a slow retrain below counts
            // against it.
            started = self.pacer.start(i + 1);
            debug!("progress: {} of {}", i + 1, limit);

            if self.queries >= self.settings.query_budget {
                warn!(queries = self.queries, "Query limit reached. Terminating.");
                end_reason = EndReason::QueryBudgetReached;
                break;
            }

            if self.settings.auto_retrain {
                self.maybe_retrain().await;
            }
        }

        self.drain_pending().await?;

        let report = self.report(end_reason, limit, clock.elapsed().as_millis() as u64);
        report.emit();
        Ok(report)
    }

    /// Steps 2–7 for one sample. Returns `false` if the committee had
    /// nothing to say about it.
    async fn process_sample(&mut self, i: SampleIndex, limit: u64) -> SessionResult<bool> {
        let verdict = match self.committee.next_prediction() {
            Ok(verdict) => verdict,
            Err(e) => {
                self.stats.committee_failures += 1;
                warn!(sample = i, "Committee prediction failed: {e:#}");
                return Ok(false);
            }
        };
        let sample = self.committee.get_current_sample();

        self.reap_pending().await?;
        lock_buffer(&self.buffer).add(sample);

        let progress = QueryProgress {
            queries_used: self.queries,
            query_budget: self.settings.query_budget,
            samples_seen: i + 1,
            sample_budget: limit,
        };
        let disagreement = self
            .evaluator
            .decide(&verdict.votes, verdict.truth, &progress);

        // Labels are for the log and the annotator only; the decision above
        // used the raw distributions.
        let votes: Vec<String> = verdict
            .votes
            .iter()
            .map(|vote| self.committee.get_label(vote.argmax()))
            .collect();
        let truth = self.committee.get_label(verdict.truth);

        let mut issued = disagreement.decision && self.open_window(i);

        let row = ResultRow {
            index: i,
            committee: votes.clone(),
            truth: truth.clone(),
            score: disagreement.score,
            decision: issued,
        };
        if let Err(e) = self.sink.record(&row) {
            self.stats.result_log_failures += 1;
            warn!(sample = i, "Failed to record result: {e}");
            // A query without its logged row would break the count of
            // logged decisions; give the window back instead.
            if issued {
                issued = false;
                let released = lock_buffer(&self.buffer).release();
                if let Err(lock_err) = released {
                    self.record_resolution(QueryResolution::LockViolation(lock_err))?;
                }
                info!(sample = i, "Query withdrawn: result row not recorded");
            }
        }

        if issued {
            self.queries += 1;
            debug!(
                sample = i,
                queries = self.queries,
                kind = %disagreement.kind,
                score = disagreement.score,
                "Query issued"
            );
            self.dispatch(QueryContext {
                index: i,
                votes,
                truth,
            })
            .await?;
        }
        Ok(true)
    }

    /// Lock the buffer for a new query; `false` if one is already in flight.
    fn open_window(&mut self, i: SampleIndex) -> bool {
        let locked = lock_buffer(&self.buffer).lock();
        match locked {
            Ok(()) => true,
            Err(e) => {
                self.stats.suppressed_queries += 1;
                info!(
                    sample = i,
                    in_flight = ?self.pending.as_ref().map(PendingQuery::index),
                    "Query suppressed: {e}"
                );
                false
            }
        }
    }

    /// Resolve the query that just locked the buffer.
    async fn dispatch(&mut self, ctx: QueryContext) -> SessionResult<()> {
        if self.strategy.is_background() {
            // The previous task has already unlocked the buffer, but its
            // handle may not have been collected yet.
            if let Some(previous) = self.pending.take() {
                let resolution = previous.join().await;
                self.record_resolution(resolution)?;
            }
            self.pending = Some(PendingQuery::spawn(
                self.strategy.clone(),
                ctx,
                self.buffer.clone(),
            ));
            return Ok(());
        }

        let answer = self.strategy.resolve(&ctx).await;
        let resolution = finish_query(&self.buffer, ctx.index, answer);
        self.record_resolution(resolution)
    }

    /// Collect a background query that has finished.
    async fn reap_pending(&mut self) -> SessionResult<()> {
        if self
            .pending
            .as_ref()
            .is_some_and(PendingQuery::is_finished)
        {
            if let Some(pending) = self.pending.take() {
                let resolution = pending.join().await;
                self.record_resolution(resolution)?;
            }
        }
        Ok(())
    }

    /// Wait for an outstanding background query before reporting.
    async fn drain_pending(&mut self) -> SessionResult<()> {
        if let Some(pending) = self.pending.take() {
            info!(
                query_sample = pending.index(),
                "Waiting for the outstanding query to be answered"
            );
            let resolution = pending.join().await;
            self.record_resolution(resolution)?;
        }
        Ok(())
    }

    fn record_resolution(&mut self, resolution: QueryResolution) -> SessionResult<()> {
        match resolution {
            QueryResolution::Committed(report) => {
                self.stats.annotated_samples += report.committed as u64;
            }
            QueryResolution::StoreFailed(e) => {
                self.stats.annotation_store_failures += 1;
                warn!("Annotations not fully persisted: {e}");
            }
            QueryResolution::Abandoned { .. } => {
                self.stats.abandoned_queries += 1;
            }
            QueryResolution::LockViolation(e) => {
                error!("Annotation buffer protocol violated: {e}");
                if cfg!(debug_assertions) {
                    panic!("annotation buffer protocol violated: {e}");
                }
                return Err(SessionError::LockState(e));
            }
        }
        Ok(())
    }

    async fn maybe_retrain(&mut self) {
        let annotations = lock_buffer(&self.buffer).annotations_handle();
        let outcome = self
            .scheduler
            .maybe_retrain(self.queries, &annotations, self.committee.as_mut())
            .await;
        if let RetrainOutcome::Failed { at_queries, .. } = outcome {
            debug!(at_queries, "Retrain failed; next attempt at the next cadence multiple");
        }
    }

    fn report(&self, end_reason: EndReason, sample_limit: u64, elapsed_ms: u64) -> SessionReport {
        SessionReport {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            elapsed_ms,
            end_reason,
            resolution: self.strategy.name().to_string(),
            samples_processed: self.stats.samples_processed,
            sample_limit,
            queries: self.queries,
            suppressed_queries: self.stats.suppressed_queries,
            abandoned_queries: self.stats.abandoned_queries,
            annotated_samples: self.stats.annotated_samples,
            annotation_store_failures: self.stats.annotation_store_failures,
            result_log_failures: self.stats.result_log_failures,
            committee_failures: self.stats.committee_failures,
            pacing_overruns: self.pacer.overruns(),
            retrain_attempts: self.scheduler.attempts(),
            retrain_failures: self.scheduler.failures(),
            result_path: self.sink.location().map(|p| p.to_path_buf()),
            annotations_path: lock_buffer(&self.buffer).annotations_handle(),
        }
    }
}
