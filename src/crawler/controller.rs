//! Crawl controller - main crawl orchestration logic
//!
//! This module contains the crawl loop that coordinates one run:
//! - Restoring progress from a checkpoint (or starting fresh)
//! - Asking the exploration strategy what to probe next
//! - Pacing every request through the rate limiter
//! - Classifying outcomes and persisting records one unit at a time
//! - Draining the retry queue and checkpointing on a bounded cadence
//! - Stopping cooperatively when cancelled

use crate::config::{validation::validate_crawler_config, Config, CrawlerConfig};
use crate::crawler::persist::persist_unit;
use crate::crawler::rate_limit::RateLimiter;
use crate::crawler::retry::{RetryDecision, RetryQueue};
use crate::crawler::source::{FetchError, ProbeSource};
use crate::crawler::strategy::{build_strategy, DoneReason, ExplorationStrategy, Ledger, Step};
use crate::state::{
    CancelToken, CheckpointStore, CrawlCheckpoint, ProbeFeedback, ProbeOutcome, ProbeTarget,
    TransientKind, CHECKPOINT_VERSION,
};
use crate::storage::{CatalogStore, Record};
use crate::{ConfigError, HarvestError};
use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::Instant;

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The strategy finished and the retry queue was emptied
    Completed(DoneReason),

    /// The cancel token was triggered
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(reason) => write!(f, "completed: {}", reason),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a finished or cancelled run
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub total_success: u64,
    pub total_errors: u64,
    pub total_absent: u64,
    pub final_checkpoint: CrawlCheckpoint,
    pub stop_reason: StopReason,
}

/// How a single probe ended, after persistence
enum Handled {
    Stored(Vec<i64>),
    Absent,
    Failed(TransientKind),
}

impl Handled {
    fn feedback(&self, target: ProbeTarget) -> ProbeFeedback {
        match self {
            Self::Stored(discovered) => ProbeFeedback::found(target, discovered.clone()),
            Self::Absent => ProbeFeedback::not_found(target),
            Self::Failed(_) => ProbeFeedback::transient(target),
        }
    }
}

/// Main crawl controller
pub struct CrawlController<P: ProbeSource, S: CatalogStore> {
    config: CrawlerConfig,
    source: P,
    store: S,
    strategy: Box<dyn ExplorationStrategy>,
    retry: RetryQueue,
    permanent: BTreeSet<i64>,
    limiter: RateLimiter,
    checkpoints: CheckpointStore,
    cancel: CancelToken,
    config_hash: Option<String>,
    total_success: u64,
    total_errors: u64,
    total_absent: u64,
    failure_streak: u32,
    dirty: bool,
}

impl<P: ProbeSource, S: CatalogStore> CrawlController<P, S> {
    /// Creates a controller positioned at the configured start id
    ///
    /// # Arguments
    ///
    /// * `config` - The full configuration; only `[crawler]` and the
    ///   checkpoint path are used here
    /// * `source` - Where pages come from
    /// * `store` - Where records go
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlController)` - Ready to run
    /// * `Err(HarvestError)` - The crawler settings are invalid
    pub fn new(config: &Config, source: P, store: S) -> Result<Self, HarvestError> {
        validate_crawler_config(&config.crawler)?;

        Ok(Self {
            config: config.crawler.clone(),
            source,
            store,
            strategy: build_strategy(&config.crawler),
            retry: RetryQueue::new(config.crawler.max_retries),
            permanent: BTreeSet::new(),
            limiter: RateLimiter::from_config(&config.crawler),
            checkpoints: CheckpointStore::new(&config.output.checkpoint_path),
            cancel: CancelToken::new(),
            config_hash: None,
            total_success: 0,
            total_errors: 0,
            total_absent: 0,
            failure_streak: 0,
            dirty: false,
        })
    }

    /// Records the config fingerprint written into checkpoints
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    /// Uses an externally owned cancel token
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle that stops the run at its next loop boundary
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Runs the crawl, resuming from the configured checkpoint if enabled
    pub async fn run(&mut self) -> Result<CrawlSummary, HarvestError> {
        if self.config.resume {
            self.restore()?;
        } else {
            tracing::info!("Starting fresh, ignoring any existing checkpoint");
        }
        self.crawl().await
    }

    /// Resumes from the checkpoint at `path`
    ///
    /// A missing file starts a fresh run that checkpoints to `path`.
    pub async fn resume(&mut self, path: impl AsRef<Path>) -> Result<CrawlSummary, HarvestError> {
        self.checkpoints = CheckpointStore::new(path.as_ref());
        self.restore()?;
        self.crawl().await
    }

    /// Current progress as a checkpoint
    pub fn checkpoint(&self) -> CrawlCheckpoint {
        let (cursor, strategy_state) = self.strategy.snapshot();
        CrawlCheckpoint {
            cursor,
            total_success: self.total_success,
            total_errors: self.total_errors,
            permanent_fails: self.permanent.clone(),
            retry_queue: self.retry.entries(),
            last_save: Utc::now(),
            version: CHECKPOINT_VERSION,
            strategy: Some(self.strategy.kind()),
            config_hash: self.config_hash.clone(),
            total_absent: self.total_absent,
            strategy_state,
        }
    }

    fn restore(&mut self) -> Result<(), HarvestError> {
        let Some(checkpoint) = self.checkpoints.load()? else {
            tracing::info!(
                "No checkpoint at {}, starting at id {}",
                self.checkpoints.path().display(),
                self.config.start_id
            );
            return Ok(());
        };

        checkpoint.validate(self.config.max_retries)?;

        if let Some(kind) = checkpoint.strategy {
            if kind != self.config.strategy {
                return Err(ConfigError::Validation(format!(
                    "checkpoint was written by strategy '{}' but config selects '{}'",
                    kind, self.config.strategy
                ))
                .into());
            }
        }

        if let (Some(saved), Some(current)) = (&checkpoint.config_hash, &self.config_hash) {
            if saved != current {
                tracing::warn!("Config file changed since the checkpoint was written");
            }
        }

        self.total_success = checkpoint.total_success;
        self.total_errors = checkpoint.total_errors;
        self.total_absent = checkpoint.total_absent;
        self.permanent = checkpoint.permanent_fails.clone();
        self.retry = RetryQueue::from_entries(self.config.max_retries, &checkpoint.retry_queue);
        self.strategy
            .restore(checkpoint.cursor, &checkpoint.strategy_state);

        tracing::info!(
            "Resuming at cursor {} ({} stored, {} errors, {} queued for retry, {} given up)",
            checkpoint.cursor,
            self.total_success,
            self.total_errors,
            self.retry.len(),
            self.permanent.len()
        );
        Ok(())
    }

    async fn crawl(&mut self) -> Result<CrawlSummary, HarvestError> {
        tracing::info!(
            "Starting {} crawl at {:.1} requests/minute",
            self.strategy.kind(),
            self.config.requests_per_minute
        );

        let start_time = Instant::now();
        let mut iterations: u64 = 0;
        let mut drained_at: u64 = 0;

        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested, stopping");
                break StopReason::Cancelled;
            }

            if iterations > drained_at && !self.retry.is_empty() && self.drain_due(iterations) {
                self.drain_retries().await;
                self.failure_streak = 0;
                drained_at = iterations;
                continue;
            }

            let step = self
                .strategy
                .next(&Ledger::new(&self.permanent, &self.retry));
            let target = match step {
                Step::Probe(target) => target,
                Step::Done(reason) => {
                    if self.retry.is_empty() {
                        tracing::info!("Strategy finished: {}", reason);
                        break StopReason::Completed(reason);
                    }
                    // Finish the pass before reporting; drained probes may
                    // change the strategy's answer
                    self.drain_retries().await;
                    drained_at = iterations;
                    continue;
                }
            };

            self.limiter.wait().await;
            let handled = self.probe(target).await;
            self.settle_primary(target, &handled);
            self.strategy.record(&handled.feedback(target));

            iterations += 1;

            if iterations % 10 == 0 {
                let rate = iterations as f64 / start_time.elapsed().as_secs_f64().max(1e-9);
                tracing::info!(
                    "Progress: {} probes, {} stored, {} errors, {} queued, {:.2} probes/sec",
                    iterations,
                    self.total_success,
                    self.total_errors,
                    self.retry.len(),
                    rate
                );
            }

            if self.dirty || iterations % u64::from(self.config.checkpoint_every) == 0 {
                self.save()?;
            }
        };

        let mut final_checkpoint = self.checkpoint();
        self.checkpoints.save(&mut final_checkpoint)?;
        self.dirty = false;

        tracing::info!(
            "Run {} after {} probes: {} stored, {} absent, {} errors, {} given up",
            stop_reason,
            iterations,
            self.total_success,
            self.total_absent,
            self.total_errors,
            self.permanent.len()
        );

        Ok(CrawlSummary {
            total_success: self.total_success,
            total_errors: self.total_errors,
            total_absent: self.total_absent,
            final_checkpoint,
            stop_reason,
        })
    }

    fn drain_due(&self, iterations: u64) -> bool {
        iterations % u64::from(self.config.drain_every) == 0
            || self.failure_streak >= self.config.failure_streak_drain
    }

    fn save(&mut self) -> Result<(), HarvestError> {
        let mut checkpoint = self.checkpoint();
        self.checkpoints.save(&mut checkpoint)?;
        self.dirty = false;
        Ok(())
    }

    /// Fetches, parses and persists one target
    async fn probe(&mut self, target: ProbeTarget) -> Handled {
        let outcome = match self.source.fetch(target).await {
            Ok(html) => match self.source.parse(&html, target) {
                Ok(records) => ProbeOutcome::Found(records),
                Err(e) => {
                    tracing::warn!("Could not parse {}: {}", target, e);
                    ProbeOutcome::TransientError(TransientKind::Parse)
                }
            },
            Err(FetchError::NotFound) => ProbeOutcome::NotFound,
            Err(FetchError::Transient(kind)) => ProbeOutcome::TransientError(kind),
        };
        tracing::debug!("Probed {}: {}", target, outcome.label());

        match outcome {
            ProbeOutcome::Found(records) => {
                let discovered = discovered_charts(&records);
                match persist_unit(&mut self.store, &records, Utc::now()) {
                    Ok(_) => {
                        self.total_success += 1;
                        self.failure_streak = 0;
                        Handled::Stored(discovered)
                    }
                    Err(e) => {
                        tracing::warn!("Storing {} failed, unit rolled back: {}", target, e);
                        self.total_errors += 1;
                        self.failure_streak += 1;
                        Handled::Failed(TransientKind::Storage)
                    }
                }
            }
            ProbeOutcome::NotFound => {
                self.total_absent += 1;
                self.failure_streak = 0;
                Handled::Absent
            }
            ProbeOutcome::TransientError(kind) => {
                tracing::warn!("Transient failure on {}: {}", target, kind);
                self.total_errors += 1;
                self.failure_streak += 1;
                Handled::Failed(kind)
            }
        }
    }

    /// Hands a failed primary probe to the retry queue
    ///
    /// Targets the queue cannot re-address (song pages under song-expand)
    /// stay with the strategy, which holds its cursor on them.
    fn settle_primary(&mut self, target: ProbeTarget, handled: &Handled) {
        let Handled::Failed(kind) = handled else {
            return;
        };
        if self.strategy.target_for(target.id()) != target {
            tracing::debug!("{} failed ({}), left to the strategy", target, kind);
            return;
        }

        let decision = self.retry.enqueue(target.id(), &mut self.permanent);
        self.note_decision(target, decision);
    }

    /// Retries every currently queued id once
    async fn drain_retries(&mut self) {
        let mut drain = self.retry.drain();
        tracing::info!("Draining {} queued retries", drain.remaining());

        while !self.cancel.is_cancelled() {
            let Some(entry) = drain.next_entry() else {
                break;
            };
            let target = self.strategy.target_for(entry.id());

            self.limiter.wait().await;
            let handled = self.probe(target).await;
            let succeeded = !matches!(handled, Handled::Failed(_));

            let decision = drain.settle(&mut self.retry, entry, succeeded, &mut self.permanent);
            self.note_decision(target, decision);
            self.strategy.record_retry(&handled.feedback(target));
        }

        let recovered = drain.finish(&mut self.retry);
        tracing::info!(
            "Drain recovered {} ids, {} still queued",
            recovered,
            self.retry.len()
        );
    }

    fn note_decision(&mut self, target: ProbeTarget, decision: RetryDecision) {
        match decision {
            RetryDecision::Queued(attempts) => {
                tracing::debug!("Queued {} for retry ({} failures)", target, attempts);
            }
            RetryDecision::Evicted => {
                tracing::warn!("Giving up on {} after repeated failures", target);
            }
            RetryDecision::Resolved | RetryDecision::AlreadyQueued => {}
        }
        if decision.changed() {
            self.dirty = true;
        }
    }
}

/// Chart ids listed by song pages among `records`
fn discovered_charts(records: &[Record]) -> Vec<i64> {
    records
        .iter()
        .filter_map(|record| match record {
            Record::Listing(listing) => Some(listing.chart_ids.iter().copied()),
            _ => None,
        })
        .flatten()
        .collect()
}
