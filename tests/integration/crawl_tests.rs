//! Integration tests for the crawler
//!
//! These tests drive the whole controller against in-process sources and a
//! real SQLite store, covering resumption, the retry cap, termination,
//! identity resolution, pacing and unit-of-work isolation.

use chart_harvest::config::{Config, CrawlerConfig, OutputConfig, SiteConfig, StrategyKind};
use chart_harvest::crawler::{
    CrawlController, DoneReason, FetchError, ParseError, ProbeSource, StopReason,
};
use chart_harvest::state::{CancelToken, CheckpointStore, TransientKind};
use chart_harvest::storage::{
    AliasRecord, CatalogStore, ChartRecord, ChartStatus, IdentityRecord, PlayerRef, Record,
    RecordLinks, SongRecord, SqliteStore, StorageError, StorageResult, StoreCounts,
};
use chart_harvest::{CrawlCheckpoint, IdentityResolver, ProbeTarget};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;

// ===== Synthetic source =====

/// How a synthetic id answers
#[derive(Debug, Clone)]
enum Behavior {
    /// Page exists
    Found,

    /// Fails transiently this many times, then exists
    FlakyThenFound(usize),

    /// Never answers
    AlwaysTransient,
}

#[derive(Default)]
struct SourceState {
    fetches: usize,
    attempts: HashMap<i64, usize>,
    cancel_after: Option<(usize, CancelToken)>,
    hang_at: Option<usize>,
}

/// Deterministic in-process catalog; clones share attempt counters
#[derive(Clone, Default)]
struct SyntheticSource {
    behaviors: Rc<HashMap<i64, Behavior>>,
    creators: Rc<HashMap<i64, PlayerRef>>,
    state: Rc<RefCell<SourceState>>,
}

impl SyntheticSource {
    fn new(behaviors: HashMap<i64, Behavior>) -> Self {
        Self {
            behaviors: Rc::new(behaviors),
            ..Self::default()
        }
    }

    fn found_up_to(last: i64) -> Self {
        Self::new((1..=last).map(|id| (id, Behavior::Found)).collect())
    }

    fn with_creators(mut self, creators: HashMap<i64, PlayerRef>) -> Self {
        self.creators = Rc::new(creators);
        self
    }

    /// Trips `token` once this many fetches have been made
    fn cancel_after(&self, fetches: usize, token: CancelToken) {
        self.state.borrow_mut().cancel_after = Some((fetches, token));
    }

    /// Never answers the fetch with this number, like a process killed mid-request
    fn hang_at(&self, fetch: usize) {
        self.state.borrow_mut().hang_at = Some(fetch);
    }

    fn fetches(&self) -> usize {
        self.state.borrow().fetches
    }
}

impl ProbeSource for SyntheticSource {
    async fn fetch(&self, target: ProbeTarget) -> Result<String, FetchError> {
        let hang = {
            let mut state = self.state.borrow_mut();
            let hang = state.hang_at == Some(state.fetches + 1);
            if hang {
                state.hang_at = None;
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.borrow_mut();
        state.fetches += 1;
        let trip = matches!(&state.cancel_after, Some((limit, _)) if state.fetches >= *limit);
        if trip {
            if let Some((_, token)) = state.cancel_after.take() {
                token.cancel();
            }
        }

        let id = target.id();
        let attempt = {
            let n = state.attempts.entry(id).or_insert(0);
            *n += 1;
            *n
        };

        match self.behaviors.get(&id) {
            None => Err(FetchError::NotFound),
            Some(Behavior::Found) => Ok(format!("page {}", id)),
            Some(Behavior::FlakyThenFound(failures)) if attempt > *failures => {
                Ok(format!("page {}", id))
            }
            Some(_) => Err(FetchError::Transient(TransientKind::Connection)),
        }
    }

    fn parse(&self, _html: &str, target: ProbeTarget) -> Result<Vec<Record>, ParseError> {
        let id = target.id();
        let song = Record::Song(SongRecord {
            sid: id,
            title: format!("Song {}", id),
            artist: "Synthetic".to_string(),
            bpm: Some(120.0),
            length_secs: Some(90),
            cover_url: None,
        });

        match target {
            ProbeTarget::Song(_) => Ok(vec![song]),
            ProbeTarget::Chart(cid) => Ok(vec![
                song,
                Record::Chart(ChartRecord {
                    cid,
                    sid: cid,
                    version: "4K Lv.10".to_string(),
                    level: Some("10".to_string()),
                    mode: 0,
                    status: ChartStatus::Stable,
                    length_secs: Some(90),
                    heat: 1,
                    donate_count: 0,
                    play_count: 1,
                    last_updated: None,
                    creator: self.creators.get(&cid).cloned(),
                    stabilizer: None,
                }),
            ]),
        }
    }
}

// ===== Store wrapper that fails on one chart =====

/// Delegates to SQLite but refuses to write one chart id
struct FailingStore {
    inner: SqliteStore,
    fail_cid: i64,
}

impl CatalogStore for FailingStore {
    fn savepoint(&mut self, name: &str) -> StorageResult<()> {
        self.inner.savepoint(name)
    }

    fn release(&mut self, name: &str) -> StorageResult<()> {
        self.inner.release(name)
    }

    fn rollback_to(&mut self, name: &str) -> StorageResult<()> {
        self.inner.rollback_to(name)
    }

    fn find_identity(&self, id: i64) -> StorageResult<Option<IdentityRecord>> {
        self.inner.find_identity(id)
    }

    fn find_identity_by_external_id(
        &self,
        external_id: &str,
    ) -> StorageResult<Option<IdentityRecord>> {
        self.inner.find_identity_by_external_id(external_id)
    }

    fn find_latest_alias(&self, display_name: &str) -> StorageResult<Option<AliasRecord>> {
        self.inner.find_latest_alias(display_name)
    }

    fn insert_identity(
        &mut self,
        external_id: Option<&str>,
        display_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<i64> {
        self.inner.insert_identity(external_id, display_name, seen_at)
    }

    fn touch_identity(
        &mut self,
        id: i64,
        display_name: &str,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.touch_identity(id, display_name, seen_at)
    }

    fn backfill_external_id(&mut self, id: i64, external_id: &str) -> StorageResult<()> {
        self.inner.backfill_external_id(id, external_id)
    }

    fn upsert_alias(
        &mut self,
        identity_id: i64,
        display_name: &str,
        external_id: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner
            .upsert_alias(identity_id, display_name, external_id, seen_at)
    }

    fn aliases_of(&self, identity_id: i64) -> StorageResult<Vec<AliasRecord>> {
        self.inner.aliases_of(identity_id)
    }

    fn upsert_record(
        &mut self,
        record: &Record,
        links: &RecordLinks,
        observed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        if let Record::Chart(chart) = record {
            if chart.cid == self.fail_cid {
                return Err(StorageError::Database("disk full".to_string()));
            }
        }
        self.inner.upsert_record(record, links, observed_at)
    }

    fn counts(&self) -> StorageResult<StoreCounts> {
        self.inner.counts()
    }
}

// ===== Helpers =====

/// Creates a test configuration writing into `dir`
fn create_test_config(dir: &TempDir, strategy: StrategyKind, end_id: Option<i64>) -> Config {
    Config {
        crawler: CrawlerConfig {
            strategy,
            start_id: 1,
            end_id,
            requests_per_minute: 60_000.0,
            jitter_factor: 0.0,
            max_retries: 3,
            max_consecutive_not_found: 10,
            drain_every: 7,
            failure_streak_drain: 3,
            checkpoint_every: 2,
            resume: true,
        },
        site: SiteConfig {
            base_url: "https://m.mugzone.net".to_string(),
            user_agent: "ChartHarvest/0.3 (test)".to_string(),
            cookie: None,
            timeout_secs: 5,
        },
        output: OutputConfig {
            database_path: dir.path().join("harvest.db").display().to_string(),
            checkpoint_path: dir.path().join("harvest.checkpoint.json").display().to_string(),
            busy_timeout_ms: 3000,
        },
    }
}

/// Mixed catalog: found, absent, flaky and dead ids
fn mixed_behaviors() -> HashMap<i64, Behavior> {
    let mut behaviors: HashMap<i64, Behavior> =
        (1..=20).map(|id| (id, Behavior::Found)).collect();
    behaviors.remove(&4);
    behaviors.remove(&11);
    behaviors.insert(3, Behavior::FlakyThenFound(1));
    behaviors.insert(8, Behavior::FlakyThenFound(3));
    behaviors.insert(13, Behavior::AlwaysTransient);
    behaviors.insert(17, Behavior::FlakyThenFound(2));
    behaviors
}

// ===== Idempotent resume =====

#[tokio::test]
async fn test_resume_after_interruption_matches_uninterrupted_run() {
    let baseline_dir = TempDir::new().unwrap();
    let config = create_test_config(&baseline_dir, StrategyKind::ForwardId, Some(20));
    let mut baseline = CrawlController::new(
        &config,
        SyntheticSource::new(mixed_behaviors()),
        SqliteStore::open_in_memory().unwrap(),
    )
    .unwrap();
    let expected = baseline.run().await.unwrap();
    let expected_counts = baseline.store().counts().unwrap();

    assert_eq!(expected.total_success, 17);
    assert_eq!(expected.final_checkpoint.permanent_fails, BTreeSet::from([13]));

    for cut in [1, 3, 5, 9, 14, 21, 26] {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir, StrategyKind::ForwardId, Some(20));
        let source = SyntheticSource::new(mixed_behaviors());

        let token = CancelToken::new();
        source.cancel_after(cut, token.clone());
        let mut first = CrawlController::new(
            &config,
            source.clone(),
            SqliteStore::open_in_memory().unwrap(),
        )
        .unwrap()
        .with_cancel_token(token);
        let interrupted = first.run().await.unwrap();
        assert_eq!(interrupted.stop_reason, StopReason::Cancelled, "cut {}", cut);
        let store = first.into_store();

        let mut second = CrawlController::new(&config, source, store).unwrap();
        let resumed = second.run().await.unwrap();

        assert_eq!(
            resumed.stop_reason,
            StopReason::Completed(DoneReason::RangeExhausted { end_id: 20 })
        );
        assert_eq!(resumed.total_success, expected.total_success, "cut {}", cut);
        assert_eq!(
            resumed.final_checkpoint.permanent_fails,
            expected.final_checkpoint.permanent_fails,
            "cut {}",
            cut
        );
        assert!(resumed.final_checkpoint.retry_queue.is_empty());
        assert_eq!(second.store().counts().unwrap(), expected_counts, "cut {}", cut);
    }
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_crash_matches_uninterrupted_run() {
    let baseline_dir = TempDir::new().unwrap();
    let config = create_test_config(&baseline_dir, StrategyKind::ForwardId, Some(20));
    let mut baseline = CrawlController::new(
        &config,
        SyntheticSource::new(mixed_behaviors()),
        SqliteStore::open_in_memory().unwrap(),
    )
    .unwrap();
    let expected = baseline.run().await.unwrap();
    let expected_counts = baseline.store().counts().unwrap();

    for cut in 1..=39 {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(&dir, StrategyKind::ForwardId, Some(20));
        let source = SyntheticSource::new(mixed_behaviors());
        source.hang_at(cut);

        // The hung run is dropped without its final checkpoint save
        let mut first = CrawlController::new(
            &config,
            source.clone(),
            SqliteStore::open_in_memory().unwrap(),
        )
        .unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(3600), first.run()).await;
        let store = first.into_store();

        let mut second = CrawlController::new(&config, source, store).unwrap();
        let resumed = second.run().await.unwrap();

        assert_eq!(
            resumed.stop_reason,
            StopReason::Completed(DoneReason::RangeExhausted { end_id: 20 }),
            "cut {}",
            cut
        );
        assert_eq!(resumed.total_success, expected.total_success, "cut {}", cut);
        assert_eq!(
            resumed.final_checkpoint.permanent_fails,
            expected.final_checkpoint.permanent_fails,
            "cut {}",
            cut
        );
        assert_eq!(second.store().counts().unwrap(), expected_counts, "cut {}", cut);
    }
}

#[tokio::test]
async fn test_song_page_failures_survive_resume() {
    let behaviors = HashMap::from([(1, Behavior::FlakyThenFound(4))]);

    let baseline_dir = TempDir::new().unwrap();
    let config = create_test_config(&baseline_dir, StrategyKind::SongExpand, Some(1));
    let mut baseline = CrawlController::new(
        &config,
        SyntheticSource::new(behaviors.clone()),
        SqliteStore::open_in_memory().unwrap(),
    )
    .unwrap();
    let expected = baseline.run().await.unwrap();
    assert_eq!(expected.total_success, 0);
    assert_eq!(
        expected.final_checkpoint.strategy_state.failed_songs,
        BTreeSet::from([1])
    );

    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, StrategyKind::SongExpand, Some(1));
    let source = SyntheticSource::new(behaviors);
    let token = CancelToken::new();
    source.cancel_after(2, token.clone());

    let mut first = CrawlController::new(
        &config,
        source.clone(),
        SqliteStore::open_in_memory().unwrap(),
    )
    .unwrap()
    .with_cancel_token(token);
    let interrupted = first.run().await.unwrap();
    assert_eq!(interrupted.stop_reason, StopReason::Cancelled);
    assert_eq!(interrupted.final_checkpoint.strategy_state.song_failures, 2);
    let store = first.into_store();

    let mut second = CrawlController::new(&config, source.clone(), store).unwrap();
    let resumed = second.run().await.unwrap();

    assert_eq!(resumed.total_success, expected.total_success);
    assert_eq!(
        resumed.final_checkpoint.strategy_state.failed_songs,
        expected.final_checkpoint.strategy_state.failed_songs
    );
    assert_eq!(source.fetches(), 4);
}

#[tokio::test]
async fn test_resume_reads_checkpoint_from_disk() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, StrategyKind::ForwardId, Some(10));
    let source = SyntheticSource::found_up_to(10);

    let token = CancelToken::new();
    source.cancel_after(4, token.clone());
    let mut first =
        CrawlController::new(&config, source.clone(), SqliteStore::open_in_memory().unwrap())
            .unwrap()
            .with_cancel_token(token);
    first.run().await.unwrap();

    let saved = CheckpointStore::new(&config.output.checkpoint_path)
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.cursor, 5);
    assert_eq!(saved.total_success, 4);
    assert_eq!(saved.strategy, Some(StrategyKind::ForwardId));

    let store = first.into_store();
    let mut second = CrawlController::new(&config, source.clone(), store).unwrap();
    let summary = second.resume(&config.output.checkpoint_path).await.unwrap();

    assert_eq!(summary.total_success, 10);
    // Ids 1-4 were never fetched again
    assert_eq!(source.fetches(), 10);
}

#[tokio::test]
async fn test_minimal_checkpoint_file_is_resumable() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, StrategyKind::ForwardId, Some(6));
    std::fs::write(
        &config.output.checkpoint_path,
        r#"{
  "cursor": 5,
  "total_success": 4,
  "total_errors": 1,
  "permanent_fails": [2],
  "retry_queue": [[3, 1]],
  "last_save": "2024-11-03T18:20:00Z"
}"#,
    )
    .unwrap();

    let source = SyntheticSource::found_up_to(6);
    let mut controller =
        CrawlController::new(&config, source.clone(), SqliteStore::open_in_memory().unwrap())
            .unwrap();
    let summary = controller.run().await.unwrap();

    // 5 and 6 from the cursor, 3 from the retry queue
    assert_eq!(summary.total_success, 7);
    assert_eq!(source.fetches(), 3);
    assert_eq!(summary.final_checkpoint.permanent_fails, BTreeSet::from([2]));
}

// ===== Retry cap =====

#[tokio::test]
async fn test_retry_cap() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, StrategyKind::ForwardId, Some(3));

    let behaviors = HashMap::from([
        (1, Behavior::Found),
        // Fails max_retries + 1 times in total
        (2, Behavior::AlwaysTransient),
        // Fails max_retries times, then succeeds
        (3, Behavior::FlakyThenFound(3)),
    ]);
    let source = SyntheticSource::new(behaviors);

    let mut controller =
        CrawlController::new(&config, source.clone(), SqliteStore::open_in_memory().unwrap())
            .unwrap();
    let summary = controller.run().await.unwrap();

    let checkpoint: &CrawlCheckpoint = &summary.final_checkpoint;
    assert_eq!(checkpoint.permanent_fails, BTreeSet::from([2]));
    assert!(checkpoint.retry_queue.iter().all(|entry| entry.id() != 2));
    assert!(checkpoint.retry_queue.is_empty());
    assert_eq!(summary.total_success, 2);
    assert_eq!(summary.total_errors, 4 + 3);
    assert_eq!(source.state.borrow().attempts[&2], 4);
    assert_eq!(source.state.borrow().attempts[&3], 4);
}

// ===== Backward termination =====

#[tokio::test]
async fn test_backward_probe_terminates_at_last_valid() {
    const K: i64 = 23;
    const N: u32 = 6;

    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, StrategyKind::BackwardSongProbe, None);
    config.crawler.max_consecutive_not_found = N;

    let source = SyntheticSource::found_up_to(K);
    let mut controller =
        CrawlController::new(&config, source.clone(), SqliteStore::open_in_memory().unwrap())
            .unwrap();
    let summary = controller.run().await.unwrap();

    assert_eq!(
        summary.stop_reason,
        StopReason::Completed(DoneReason::SpaceExhausted {
            last_valid: Some(K)
        })
    );
    assert!(source.fetches() <= (K as usize) + (N as usize));
    assert_eq!(summary.final_checkpoint.strategy_state.last_valid, Some(K));
    assert_eq!(controller.store().counts().unwrap().songs, K as u64);
}

#[tokio::test]
async fn test_backward_probe_gap_shorter_than_limit_is_crossed() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, StrategyKind::BackwardSongProbe, None);
    config.crawler.max_consecutive_not_found = 3;

    let mut behaviors: HashMap<i64, Behavior> = (1..=5).map(|id| (id, Behavior::Found)).collect();
    behaviors.insert(8, Behavior::Found);
    let source = SyntheticSource::new(behaviors);

    let mut controller =
        CrawlController::new(&config, source, SqliteStore::open_in_memory().unwrap()).unwrap();
    let summary = controller.run().await.unwrap();

    assert_eq!(
        summary.stop_reason,
        StopReason::Completed(DoneReason::SpaceExhausted { last_valid: Some(8) })
    );
}

// ===== Identity resolution through the crawl =====

fn player(name: &str, uid: Option<i64>) -> PlayerRef {
    PlayerRef {
        name: name.to_string(),
        uid,
    }
}

#[tokio::test]
async fn test_rename_merges_and_collisions_stay_apart() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, StrategyKind::ForwardId, Some(5));

    let creators = HashMap::from([
        (1, player("Alice", None)),
        (2, player("Alice", Some(1001))),
        (3, player("Bob", Some(1001))),
        (4, player("X", Some(2001))),
        (5, player("X", Some(2002))),
    ]);
    let source = SyntheticSource::found_up_to(5).with_creators(creators);

    let mut controller =
        CrawlController::new(&config, source, SqliteStore::open_in_memory().unwrap()).unwrap();
    controller.run().await.unwrap();

    let mut store = controller.into_store();
    let resolver = IdentityResolver::new(&mut store);

    let bob = resolver.lookup("1001").unwrap().unwrap();
    assert_eq!(bob.current_display_name, "Bob");
    let names: BTreeSet<String> = resolver
        .aliases(bob.id)
        .unwrap()
        .into_iter()
        .map(|alias| alias.display_name)
        .collect();
    assert_eq!(names, BTreeSet::from(["Alice".to_string(), "Bob".to_string()]));

    let x1 = resolver.lookup("2001").unwrap().unwrap();
    let x2 = resolver.lookup("2002").unwrap().unwrap();
    assert_ne!(x1.id, x2.id);
    assert_eq!(x1.current_display_name, "X");
    assert_eq!(x2.current_display_name, "X");

    // Bob's identity plus the two X accounts
    assert_eq!(store.counts().unwrap().identities, 3);
}

// ===== Rate bound =====

#[tokio::test(start_paused = true)]
async fn test_rate_bound_without_jitter() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, StrategyKind::ForwardId, Some(60));
    config.crawler.requests_per_minute = 30.0;
    config.crawler.jitter_factor = 0.0;

    let source = SyntheticSource::found_up_to(60);
    let mut controller =
        CrawlController::new(&config, source.clone(), SqliteStore::open_in_memory().unwrap())
            .unwrap();

    let start = tokio::time::Instant::now();
    controller.run().await.unwrap();
    let elapsed = start.elapsed().as_secs_f64();

    assert_eq!(source.fetches(), 60);
    assert!((118.0..=122.0).contains(&elapsed), "elapsed {}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_rate_bound_within_jitter_band() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir, StrategyKind::ForwardId, Some(60));
    config.crawler.requests_per_minute = 30.0;
    config.crawler.jitter_factor = 0.25;

    let source = SyntheticSource::found_up_to(60);
    let mut controller =
        CrawlController::new(&config, source.clone(), SqliteStore::open_in_memory().unwrap())
            .unwrap();

    let start = tokio::time::Instant::now();
    controller.run().await.unwrap();
    let elapsed = start.elapsed().as_secs_f64();

    assert_eq!(source.fetches(), 60);
    assert!((90.0..=150.0).contains(&elapsed), "elapsed {}", elapsed);
}

// ===== Unit-of-work isolation =====

#[tokio::test]
async fn test_storage_failure_keeps_committed_units() {
    let dir = TempDir::new().unwrap();
    let config = create_test_config(&dir, StrategyKind::ForwardId, Some(5));

    let store = FailingStore {
        inner: SqliteStore::open_in_memory().unwrap(),
        fail_cid: 3,
    };
    let source = SyntheticSource::found_up_to(5);

    let mut controller = CrawlController::new(&config, source, store).unwrap();
    let summary = controller.run().await.unwrap();

    // Charts 1, 2, 4 and 5 committed; chart 3's unit rolled back every time
    assert_eq!(summary.total_success, 4);
    assert_eq!(summary.final_checkpoint.permanent_fails, BTreeSet::from([3]));

    let counts = controller.store().counts().unwrap();
    assert_eq!(counts.charts, 4);
    assert_eq!(counts.songs, 4);
}
