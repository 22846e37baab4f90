//! Exploration strategies
//!
//! A strategy is a pure policy: it picks the next page to probe and decides
//! when a run is finished, based only on the feedback the controller gives
//! it. It never performs I/O.

use crate::config::{CrawlerConfig, StrategyKind};
use crate::crawler::retry::RetryQueue;
use crate::state::{FeedbackKind, ProbeFeedback, ProbeTarget, StrategyState};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// What to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Probe(ProbeTarget),
    Done(DoneReason),
}

/// Why a strategy finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// The configured end id was passed
    RangeExhausted { end_id: i64 },

    /// A long run of absent ids; `last_valid` is the highest id found
    SpaceExhausted { last_valid: Option<i64> },
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RangeExhausted { end_id } => write!(f, "reached end id {}", end_id),
            Self::SpaceExhausted {
                last_valid: Some(id),
            } => write!(f, "id space exhausted, last valid id {}", id),
            Self::SpaceExhausted { last_valid: None } => {
                write!(f, "id space exhausted, nothing found")
            }
        }
    }
}

/// Ids a strategy must not hand out again in this pass
pub struct Ledger<'a> {
    permanent: &'a BTreeSet<i64>,
    retry: &'a RetryQueue,
}

impl<'a> Ledger<'a> {
    pub fn new(permanent: &'a BTreeSet<i64>, retry: &'a RetryQueue) -> Self {
        Self { permanent, retry }
    }

    /// True if the id was given up on or is owned by the retry queue
    pub fn is_settled(&self, id: i64) -> bool {
        self.permanent.contains(&id) || self.retry.contains(id)
    }
}

/// Policy deciding probe order and termination
pub trait ExplorationStrategy {
    fn kind(&self) -> StrategyKind;

    /// Next page to probe, or the reason the run is over
    ///
    /// Calling `next` again without recording feedback returns the same step.
    fn next(&mut self, ledger: &Ledger<'_>) -> Step;

    /// Feeds back the handled outcome of the probe `next` returned
    fn record(&mut self, feedback: &ProbeFeedback);

    /// Feeds back the outcome of a retry-queue probe
    fn record_retry(&mut self, _feedback: &ProbeFeedback) {}

    /// Page kind for ids held in the retry queue
    fn target_for(&self, id: i64) -> ProbeTarget;

    /// Cursor and extra state to persist
    fn snapshot(&self) -> (i64, StrategyState);

    /// Restores from a checkpoint
    fn restore(&mut self, cursor: i64, state: &StrategyState);
}

/// Builds the strategy the config asks for, positioned at `start-id`
pub fn build_strategy(config: &CrawlerConfig) -> Box<dyn ExplorationStrategy> {
    match config.strategy {
        StrategyKind::ForwardId => Box::new(ForwardId::new(config.start_id, config.end_id)),
        StrategyKind::SongExpand => Box::new(SongExpand::new(
            config.start_id,
            config.end_id,
            config.max_retries,
        )),
        StrategyKind::BackwardSongProbe => Box::new(BackwardSongProbe::new(
            config.start_id,
            config.end_id,
            config.max_consecutive_not_found,
        )),
    }
}

// ===== ForwardID =====

/// Walks chart ids upward
#[derive(Debug, Clone)]
pub struct ForwardId {
    cursor: i64,
    end_id: Option<i64>,
}

impl ForwardId {
    pub fn new(start_id: i64, end_id: Option<i64>) -> Self {
        Self {
            cursor: start_id,
            end_id,
        }
    }
}

impl ExplorationStrategy for ForwardId {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ForwardId
    }

    fn next(&mut self, ledger: &Ledger<'_>) -> Step {
        while ledger.is_settled(self.cursor) {
            self.cursor += 1;
        }
        match self.end_id {
            Some(end_id) if self.cursor > end_id => Step::Done(DoneReason::RangeExhausted { end_id }),
            _ => Step::Probe(ProbeTarget::Chart(self.cursor)),
        }
    }

    fn record(&mut self, feedback: &ProbeFeedback) {
        if feedback.target == ProbeTarget::Chart(self.cursor) {
            self.cursor += 1;
        }
    }

    fn target_for(&self, id: i64) -> ProbeTarget {
        ProbeTarget::Chart(id)
    }

    fn snapshot(&self) -> (i64, StrategyState) {
        (self.cursor, StrategyState::default())
    }

    fn restore(&mut self, cursor: i64, _state: &StrategyState) {
        self.cursor = cursor;
    }
}

// ===== SongExpand =====

/// Walks song ids upward and probes every chart each song lists
#[derive(Debug, Clone)]
pub struct SongExpand {
    song_cursor: i64,
    end_id: Option<i64>,
    max_retries: u32,
    current_song: Option<i64>,
    pending_charts: VecDeque<i64>,
    empty_songs: BTreeSet<i64>,
    failed_songs: BTreeSet<i64>,
    song_failures: u32,
}

impl SongExpand {
    pub fn new(start_id: i64, end_id: Option<i64>, max_retries: u32) -> Self {
        Self {
            song_cursor: start_id,
            end_id,
            max_retries,
            current_song: None,
            pending_charts: VecDeque::new(),
            empty_songs: BTreeSet::new(),
            failed_songs: BTreeSet::new(),
            song_failures: 0,
        }
    }

    fn finish_song_page(&mut self, sid: i64) {
        self.song_failures = 0;
        self.song_cursor = sid + 1;
    }
}

impl ExplorationStrategy for SongExpand {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SongExpand
    }

    fn next(&mut self, ledger: &Ledger<'_>) -> Step {
        while let Some(&cid) = self.pending_charts.front() {
            if !ledger.is_settled(cid) {
                return Step::Probe(ProbeTarget::Chart(cid));
            }
            self.pending_charts.pop_front();
        }
        self.current_song = None;

        while self.empty_songs.contains(&self.song_cursor)
            || self.failed_songs.contains(&self.song_cursor)
        {
            self.song_cursor += 1;
        }

        match self.end_id {
            Some(end_id) if self.song_cursor > end_id => {
                Step::Done(DoneReason::RangeExhausted { end_id })
            }
            _ => Step::Probe(ProbeTarget::Song(self.song_cursor)),
        }
    }

    fn record(&mut self, feedback: &ProbeFeedback) {
        match feedback.target {
            ProbeTarget::Song(sid) if sid == self.song_cursor => match &feedback.kind {
                FeedbackKind::Found { discovered } => {
                    self.finish_song_page(sid);
                    let mut charts: Vec<i64> = discovered.clone();
                    charts.sort_unstable();
                    charts.dedup();
                    if charts.is_empty() {
                        tracing::debug!("Song s{} lists no charts", sid);
                        self.empty_songs.insert(sid);
                    } else {
                        self.current_song = Some(sid);
                        self.pending_charts = charts.into();
                    }
                }
                FeedbackKind::NotFound => self.finish_song_page(sid),
                FeedbackKind::Transient => {
                    self.song_failures += 1;
                    if self.song_failures > self.max_retries {
                        tracing::warn!(
                            "Song s{} failed {} times, skipping it",
                            sid,
                            self.song_failures
                        );
                        self.failed_songs.insert(sid);
                        self.finish_song_page(sid);
                    }
                }
            },
            ProbeTarget::Chart(cid) => {
                if self.pending_charts.front() == Some(&cid) {
                    self.pending_charts.pop_front();
                }
            }
            ProbeTarget::Song(_) => {}
        }
    }

    fn target_for(&self, id: i64) -> ProbeTarget {
        ProbeTarget::Chart(id)
    }

    fn snapshot(&self) -> (i64, StrategyState) {
        let state = StrategyState {
            current_song: self.current_song,
            pending_charts: self.pending_charts.iter().copied().collect(),
            empty_songs: self.empty_songs.clone(),
            failed_songs: self.failed_songs.clone(),
            song_failures: self.song_failures,
            ..StrategyState::default()
        };
        (self.song_cursor, state)
    }

    fn restore(&mut self, cursor: i64, state: &StrategyState) {
        self.song_cursor = cursor;
        self.current_song = state.current_song;
        self.pending_charts = state.pending_charts.iter().copied().collect();
        self.empty_songs = state.empty_songs.clone();
        self.failed_songs = state.failed_songs.clone();
        self.song_failures = state.song_failures;
    }
}

// ===== BackwardSongProbe =====

/// Walks song ids until a long run of absent ids shows the space is exhausted
#[derive(Debug, Clone)]
pub struct BackwardSongProbe {
    cursor: i64,
    end_id: Option<i64>,
    max_consecutive_not_found: u32,
    consecutive_not_found: u32,
    last_valid: Option<i64>,
}

impl BackwardSongProbe {
    pub fn new(start_id: i64, end_id: Option<i64>, max_consecutive_not_found: u32) -> Self {
        Self {
            cursor: start_id,
            end_id,
            max_consecutive_not_found,
            consecutive_not_found: 0,
            last_valid: None,
        }
    }

    pub fn last_valid(&self) -> Option<i64> {
        self.last_valid
    }

    fn mark_valid(&mut self, id: i64) {
        self.last_valid = Some(self.last_valid.map_or(id, |last| last.max(id)));
    }
}

impl ExplorationStrategy for BackwardSongProbe {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BackwardSongProbe
    }

    fn next(&mut self, ledger: &Ledger<'_>) -> Step {
        if self.consecutive_not_found >= self.max_consecutive_not_found {
            return Step::Done(DoneReason::SpaceExhausted {
                last_valid: self.last_valid,
            });
        }

        while ledger.is_settled(self.cursor) {
            self.cursor += 1;
        }

        match self.end_id {
            Some(end_id) if self.cursor > end_id => Step::Done(DoneReason::RangeExhausted { end_id }),
            _ => Step::Probe(ProbeTarget::Song(self.cursor)),
        }
    }

    fn record(&mut self, feedback: &ProbeFeedback) {
        let ProbeTarget::Song(sid) = feedback.target else {
            return;
        };

        match feedback.kind {
            FeedbackKind::Found { .. } => {
                self.consecutive_not_found = 0;
                self.mark_valid(sid);
            }
            FeedbackKind::NotFound => self.consecutive_not_found += 1,
            FeedbackKind::Transient => {}
        }

        if sid == self.cursor {
            self.cursor += 1;
        }
    }

    fn record_retry(&mut self, feedback: &ProbeFeedback) {
        if let (ProbeTarget::Song(sid), FeedbackKind::Found { .. }) =
            (feedback.target, &feedback.kind)
        {
            self.mark_valid(sid);
        }
    }

    fn target_for(&self, id: i64) -> ProbeTarget {
        ProbeTarget::Song(id)
    }

    fn snapshot(&self) -> (i64, StrategyState) {
        let state = StrategyState {
            last_valid: self.last_valid,
            consecutive_not_found: self.consecutive_not_found,
            ..StrategyState::default()
        };
        (self.cursor, state)
    }

    fn restore(&mut self, cursor: i64, state: &StrategyState) {
        self.cursor = cursor;
        self.last_valid = state.last_valid;
        self.consecutive_not_found = state.consecutive_not_found;
    }
}
