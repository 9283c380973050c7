//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks
//! use `Arc<Mutex<_>>` for interior mutability, allowing test assertions
//! on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::config::CrawlConfig;
use crate::error::AppError;
use crate::job::{JobConfig, JobExecutionRecord};
use crate::job_store::JobStore;
use crate::models::{
    BookInfo, BookRef, BookSnapshot, DetailFetch, RankingInfo, RankingRef, RankingSnapshot,
    TypedRecord,
};
use crate::traits::{CrawlStore, Fetcher, ParseContext, Parser};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A crawl config with one well-formed task and one task pointing at a
/// missing template.
pub fn test_crawl_config() -> CrawlConfig {
    serde_json::from_value(serde_json::json!({
        "url_templates": {
            "ranking_page": "https://api.test/rank/{channel}",
            "book_detail": "https://api.test/book/{book_id}"
        },
        "tasks": [
            {
                "task_id": "fantasy",
                "template": "ranking_page",
                "params": {"channel": "fantasy"},
                "detail_template": "book_detail"
            },
            {
                "task_id": "dangling",
                "template": "missing"
            }
        ]
    }))
    .expect("static test config is valid")
}

/// Page payload in the stub format: one entry per ranking, listing the
/// referenced book ids in position order.
pub fn ranking_page_payload(rankings: &[(&str, &[&str])]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = rankings
        .iter()
        .map(|(rank_id, book_ids)| {
            let books: Vec<serde_json::Value> = book_ids
                .iter()
                .map(|id| serde_json::json!({"book_id": id}))
                .collect();
            serde_json::json!({
                "rank_id": rank_id,
                "name": format!("Ranking {rank_id}"),
                "books": books,
            })
        })
        .collect();
    serde_json::json!({ "rankings": entries })
}

/// A plausible detail payload for any book.
pub fn book_detail_payload() -> serde_json::Value {
    serde_json::json!({
        "book": {
            "title": "Stub Book",
            "author": "anon",
            "status": "ongoing",
            "clicks": "1,024",
            "favorites": 17,
            "comments": 3,
            "word_count": "1.5万"
        }
    })
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with per-URL response queues and a recorded call log.
#[derive(Clone, Default)]
pub struct MockFetcher {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<serde_json::Value, AppError>>>>>,
    default_book: Arc<Mutex<bool>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payload for one URL. Multiple calls queue in order.
    pub fn respond(self, url: &str, payload: serde_json::Value) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(Ok(payload));
        self
    }

    /// Queue an error for one URL.
    pub fn respond_err(self, url: &str, error: AppError) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(Err(error));
        self
    }

    /// Serve [`book_detail_payload`] for any URL without a queued response.
    pub fn with_default_book(self) -> Self {
        *self.default_book.lock().unwrap() = true;
        self
    }

    /// Every URL fetched, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<serde_json::Value, AppError> {
        self.calls.lock().unwrap().push(url.to_string());

        let queued = self
            .responses
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        match queued {
            Some(result) => result,
            None if *self.default_book.lock().unwrap() => Ok(book_detail_payload()),
            None => Err(AppError::Network(format!("no stubbed response for {url}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// StubParser
// ---------------------------------------------------------------------------

/// Parser over the stub payload format used in tests.
///
/// `{"rankings": [...]}` yields Ranking records with nested detail
/// fetches, `{"book": {...}}` yields a Book record, and
/// `{"parse_error": true}` fails.
#[derive(Clone, Copy, Default)]
pub struct StubParser;

impl Parser for StubParser {
    fn parse(
        &self,
        payload: &serde_json::Value,
        ctx: &ParseContext,
    ) -> Result<Vec<TypedRecord>, AppError> {
        if payload
            .get("parse_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Err(AppError::Parse("stubbed parse failure".into()));
        }

        if let Some(rankings) = payload.get("rankings").and_then(|v| v.as_array()) {
            let records = rankings
                .iter()
                .map(|ranking| {
                    let nested = ranking
                        .get("books")
                        .and_then(|v| v.as_array())
                        .map(|books| {
                            books
                                .iter()
                                .filter_map(|b| b.get("book_id").and_then(|v| v.as_str()))
                                .map(|book_id| DetailFetch {
                                    book_id: book_id.to_string(),
                                    url: ctx
                                        .detail_url(book_id)
                                        .unwrap_or_else(|| format!("stub://book/{book_id}")),
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    TypedRecord::Ranking {
                        payload: ranking.clone(),
                        nested,
                    }
                })
                .collect();
            return Ok(records);
        }

        if let Some(book) = payload.get("book") {
            return Ok(vec![TypedRecord::Book {
                payload: book.clone(),
            }]);
        }

        Err(AppError::Parse("unrecognized payload shape".into()))
    }
}

// ---------------------------------------------------------------------------
// MockCrawlStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreFailure {
    Commit,
    BookSnapshots,
}

/// Transaction buffer: writes stay here until commit.
#[derive(Default)]
pub struct MockTx {
    books: Vec<BookInfo>,
    rankings: Vec<RankingInfo>,
    book_snapshots: Vec<BookSnapshot>,
    ranking_snapshots: Vec<RankingSnapshot>,
}

/// Mock store exposing what was committed, with injectable failures.
#[derive(Clone, Default)]
pub struct MockCrawlStore {
    pub committed_books: Arc<Mutex<Vec<BookInfo>>>,
    pub committed_rankings: Arc<Mutex<Vec<RankingInfo>>>,
    pub committed_book_snapshots: Arc<Mutex<Vec<BookSnapshot>>>,
    pub committed_ranking_snapshots: Arc<Mutex<Vec<RankingSnapshot>>>,
    pub rollbacks: Arc<Mutex<u32>>,
    failure: Arc<Mutex<Option<StoreFailure>>>,
}

impl MockCrawlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail at the commit step.
    pub fn fail_commit(self) -> Self {
        *self.failure.lock().unwrap() = Some(StoreFailure::Commit);
        self
    }

    /// Fail when book snapshots are written.
    pub fn fail_book_snapshots(self) -> Self {
        *self.failure.lock().unwrap() = Some(StoreFailure::BookSnapshots);
        self
    }

    fn failure_is(&self, failure: StoreFailure) -> bool {
        *self.failure.lock().unwrap() == Some(failure)
    }
}

impl CrawlStore for MockCrawlStore {
    type Tx = MockTx;

    async fn begin(&self) -> Result<MockTx, AppError> {
        Ok(MockTx::default())
    }

    async fn create_or_update_book(
        &self,
        tx: &mut MockTx,
        book: &BookInfo,
    ) -> Result<BookRef, AppError> {
        tx.books.push(book.clone());
        Ok(BookRef(uuid::Uuid::new_v4()))
    }

    async fn create_or_update_ranking(
        &self,
        tx: &mut MockTx,
        ranking: &RankingInfo,
    ) -> Result<RankingRef, AppError> {
        tx.rankings.push(ranking.clone());
        Ok(RankingRef(uuid::Uuid::new_v4()))
    }

    async fn batch_create_book_snapshots(
        &self,
        tx: &mut MockTx,
        snapshots: &[BookSnapshot],
    ) -> Result<(), AppError> {
        if self.failure_is(StoreFailure::BookSnapshots) {
            return Err(AppError::Storage("book snapshot insert failed".into()));
        }
        tx.book_snapshots.extend_from_slice(snapshots);
        Ok(())
    }

    async fn batch_create_ranking_snapshots(
        &self,
        tx: &mut MockTx,
        snapshots: &[RankingSnapshot],
    ) -> Result<(), AppError> {
        tx.ranking_snapshots.extend_from_slice(snapshots);
        Ok(())
    }

    async fn commit(&self, tx: MockTx) -> Result<(), AppError> {
        if self.failure_is(StoreFailure::Commit) {
            return Err(AppError::Storage("commit failed".into()));
        }
        self.committed_books.lock().unwrap().extend(tx.books);
        self.committed_rankings.lock().unwrap().extend(tx.rankings);
        self.committed_book_snapshots
            .lock()
            .unwrap()
            .extend(tx.book_snapshots);
        self.committed_ranking_snapshots
            .lock()
            .unwrap()
            .extend(tx.ranking_snapshots);
        Ok(())
    }

    async fn rollback(&self, _tx: MockTx) -> Result<(), AppError> {
        *self.rollbacks.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

/// In-memory JobStore, durable for the lifetime of its Arc.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<HashMap<String, JobConfig>>>,
    runs: Arc<Mutex<Vec<JobExecutionRecord>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    async fn save_job(&self, config: &JobConfig) -> Result<(), AppError> {
        self.jobs
            .lock()
            .unwrap()
            .insert(config.job_id.clone(), config.clone());
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<JobConfig>, AppError> {
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), AppError> {
        self.jobs.lock().unwrap().remove(job_id);
        Ok(())
    }

    async fn append_run(&self, record: &JobExecutionRecord) -> Result<(), AppError> {
        self.runs.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn get_runs(
        &self,
        job_id: &str,
        limit: usize,
    ) -> Result<Vec<JobExecutionRecord>, AppError> {
        let runs = self.runs.lock().unwrap();
        let mut matching: Vec<JobExecutionRecord> = runs
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        matching.reverse();
        matching.truncate(limit);
        Ok(matching)
    }
}
