//! Crawl orchestration: one task end to end.
//!
//! Pipeline: resolve URL → fetch page → parse → dedup book refs →
//! bounded-concurrency detail fan-out → normalize → persist in one
//! transaction → summarize. Generic over all external collaborators via
//! traits, enabling dependency injection and testability without real
//! HTTP or database access.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::CrawlConfig;
use crate::error::AppError;
use crate::models::{
    BookInfo, BookSnapshot, CrawlResult, DetailFetch, RankingInfo, RankingSnapshot, TypedRecord,
};
use crate::traits::{CrawlStore, Fetcher, ParseContext, Parser};

/// Absolute ceiling on detail-fetch batch size, whatever the configured
/// concurrency says.
const MAX_BATCH_SIZE: usize = 10;

/// Tuning for the detail-fetch fan-out.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Simultaneous in-flight detail requests (also the batch size,
    /// capped at [`MAX_BATCH_SIZE`]).
    pub detail_concurrency: usize,
    /// Pause between detail batches.
    pub batch_delay: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            detail_concurrency: 5,
            batch_delay: Duration::from_millis(500),
        }
    }
}

/// Drives one crawl task to completion and reports a single [`CrawlResult`].
pub struct CrawlOrchestrator<F, P, S>
where
    F: Fetcher + 'static,
    P: Parser + 'static,
    S: CrawlStore,
{
    config: Arc<CrawlConfig>,
    fetcher: F,
    parser: P,
    store: S,
    settings: CrawlSettings,
}

impl<F, P, S> CrawlOrchestrator<F, P, S>
where
    F: Fetcher + 'static,
    P: Parser + 'static,
    S: CrawlStore,
{
    pub fn new(config: Arc<CrawlConfig>, fetcher: F, parser: P, store: S) -> Self {
        Self {
            config,
            fetcher,
            parser,
            store,
            settings: CrawlSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CrawlSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Execute one crawl task. Never returns an error: every failure mode
    /// is folded into the result's success flag and message.
    pub async fn run(&self, task_id: &str) -> CrawlResult {
        let started = Instant::now();
        match self.run_inner(task_id).await {
            Ok(books_crawled) => {
                tracing::info!(
                    task_id,
                    books_crawled,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Crawl task completed"
                );
                CrawlResult::succeeded(task_id, books_crawled, started.elapsed())
            }
            Err(err) => {
                tracing::warn!(task_id, error = %err, "Crawl task failed");
                CrawlResult::failed(task_id, &err, started.elapsed())
            }
        }
    }

    async fn run_inner(&self, task_id: &str) -> Result<usize, AppError> {
        // 1. Resolve the task; unknown ids fail fast.
        let task = self.config.resolve(task_id)?;
        let task_config = self
            .config
            .task(task_id)
            .ok_or_else(|| AppError::UnknownTask(task_id.to_string()))?;

        let ctx = ParseContext {
            task_id: task.task_id.clone(),
            detail_url_template: task_config
                .detail_template
                .as_ref()
                .and_then(|name| self.config.url_templates.get(name).cloned()),
        };

        // 2. Fetch the page; a terminal fetch error is task-fatal.
        tracing::info!(task_id, url = %task.url, "Fetching ranking page");
        let payload = self.fetcher.fetch(&task.url).await?;

        // 3. Parse into typed records.
        let records = self.parser.parse(&payload, &ctx)?;
        let rankings: Vec<&TypedRecord> = records
            .iter()
            .filter(|r| matches!(r, TypedRecord::Ranking { .. }))
            .collect();
        tracing::debug!(
            task_id,
            records = records.len(),
            rankings = rankings.len(),
            "Parsed page payload"
        );

        // 4. Session-scoped dedup: a book id seen in an earlier ranking of
        // this same task is fetched once. History never suppresses a fetch;
        // every run takes a fresh snapshot.
        let mut crawled_book_ids: HashSet<String> = HashSet::new();
        let mut detail_fetches: Vec<DetailFetch> = Vec::new();
        for record in &records {
            for fetch in record.nested() {
                if crawled_book_ids.insert(fetch.book_id.clone()) {
                    detail_fetches.push(fetch.clone());
                }
            }
        }

        // 5. Bounded-concurrency detail fan-out.
        let books = self.fetch_book_details(&ctx, detail_fetches).await;
        let fetched_ids: HashSet<&str> = books.iter().map(|b| b.0.book_id.as_str()).collect();

        // 6–7. Translate records into storage writes, one transaction per task.
        let captured_at = Utc::now();
        let ranking_infos: Vec<RankingInfo> = rankings
            .iter()
            .filter_map(|r| RankingInfo::from_payload(r.payload()))
            .collect();
        let ranking_snapshots: Vec<RankingSnapshot> = rankings
            .iter()
            .flat_map(|r| ranking_positions(r, captured_at))
            .filter(|snap| fetched_ids.contains(snap.book_id.as_str()))
            .collect();
        let book_snapshots: Vec<BookSnapshot> = books.iter().map(|b| b.1.clone()).collect();

        self.persist(
            &ranking_infos,
            &books.iter().map(|b| b.0.clone()).collect::<Vec<_>>(),
            &ranking_snapshots,
            &book_snapshots,
        )
        .await?;

        Ok(books.len())
    }

    /// Fetch and parse detail payloads for the deduplicated book list.
    ///
    /// Runs in batches sized by the configured concurrency (absolute cap
    /// applies), with a semaphore limiting in-flight requests and a fixed
    /// delay between batches. Individual failures are logged and dropped;
    /// siblings are never cancelled. Result order is not significant —
    /// entries are correlated by book id.
    async fn fetch_book_details(
        &self,
        ctx: &ParseContext,
        fetches: Vec<DetailFetch>,
    ) -> Vec<(BookInfo, BookSnapshot)> {
        let concurrency = self.settings.detail_concurrency.clamp(1, MAX_BATCH_SIZE);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut collected = Vec::with_capacity(fetches.len());
        let total_batches = fetches.len().div_ceil(concurrency.max(1));

        for (batch_idx, batch) in fetches.chunks(concurrency).enumerate() {
            let mut join_set: JoinSet<Option<(BookInfo, BookSnapshot)>> = JoinSet::new();

            for fetch in batch {
                let fetcher = self.fetcher.clone();
                let parser = self.parser.clone();
                let ctx = ctx.clone();
                let fetch = fetch.clone();
                let permit_source = semaphore.clone();

                join_set.spawn(async move {
                    // Closed only on orchestrator drop, which cannot happen
                    // while this task is joined below.
                    let _permit = permit_source.acquire_owned().await.ok()?;
                    fetch_one_detail(&fetcher, &parser, &ctx, &fetch).await
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Some(book)) => collected.push(book),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "Detail fetch task panicked");
                    }
                }
            }

            if batch_idx + 1 < total_batches {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        collected
    }

    async fn persist(
        &self,
        rankings: &[RankingInfo],
        books: &[BookInfo],
        ranking_snapshots: &[RankingSnapshot],
        book_snapshots: &[BookSnapshot],
    ) -> Result<(), AppError> {
        let mut tx = self.store.begin().await?;

        let result = async {
            for ranking in rankings {
                self.store.create_or_update_ranking(&mut tx, ranking).await?;
            }
            for book in books {
                self.store.create_or_update_book(&mut tx, book).await?;
            }
            self.store
                .batch_create_ranking_snapshots(&mut tx, ranking_snapshots)
                .await?;
            self.store
                .batch_create_book_snapshots(&mut tx, book_snapshots)
                .await?;
            Ok::<(), AppError>(())
        }
        .await;

        match result {
            Ok(()) => self.store.commit(tx).await,
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    tracing::error!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// One detail fetch + parse. Any failure is absorbed here: logged at warn
/// and reported as `None` so the fan-in simply drops the book.
async fn fetch_one_detail<F: Fetcher, P: Parser>(
    fetcher: &F,
    parser: &P,
    ctx: &ParseContext,
    fetch: &DetailFetch,
) -> Option<(BookInfo, BookSnapshot)> {
    let payload = match fetcher.fetch(&fetch.url).await {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(book_id = %fetch.book_id, error = %err, "Detail fetch failed, skipping book");
            return None;
        }
    };

    let records = match parser.parse(&payload, ctx) {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!(book_id = %fetch.book_id, error = %err, "Detail parse failed, skipping book");
            return None;
        }
    };

    let book_payload = records.iter().find_map(|r| match r {
        TypedRecord::Book { payload } => Some(payload),
        _ => None,
    })?;

    let captured_at = Utc::now();
    Some((
        BookInfo::from_payload(&fetch.book_id, book_payload),
        BookSnapshot::from_payload(&fetch.book_id, book_payload, captured_at),
    ))
}

/// Positions of the books listed on one ranking record. The payload's
/// `books` array gives explicit positions; entries without one get their
/// 1-based index.
fn ranking_positions(
    record: &TypedRecord,
    captured_at: chrono::DateTime<Utc>,
) -> Vec<RankingSnapshot> {
    let payload = record.payload();
    let Some(ranking_id) = payload.get("rank_id").and_then(|v| v.as_str()) else {
        return Vec::new();
    };
    let Some(entries) = payload.get("books").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            let book_id = entry.get("book_id").and_then(|v| v.as_str())?;
            let position = entry
                .get("position")
                .and_then(|v| v.as_u64())
                .unwrap_or(idx as u64 + 1) as u32;
            Some(RankingSnapshot {
                ranking_id: ranking_id.to_string(),
                book_id: book_id.to_string(),
                position,
                captured_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testutil::*;

    fn orchestrator(
        fetcher: MockFetcher,
        store: MockCrawlStore,
    ) -> CrawlOrchestrator<MockFetcher, StubParser, MockCrawlStore> {
        CrawlOrchestrator::new(
            Arc::new(test_crawl_config()),
            fetcher,
            StubParser,
            store,
        )
        .with_settings(CrawlSettings {
            detail_concurrency: 3,
            batch_delay: Duration::from_millis(0),
        })
    }

    #[tokio::test]
    async fn unknown_task_fails_fast() {
        let store = MockCrawlStore::new();
        let orch = orchestrator(MockFetcher::new(), store);
        let result = orch.run("no-such-task").await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(ErrorKind::Config));
        assert!(result.error.unwrap().contains("no-such-task"));
    }

    #[tokio::test]
    async fn page_fetch_error_is_task_fatal() {
        let fetcher = MockFetcher::new().respond_err(
            "https://api.test/rank/fantasy",
            AppError::Network("refused".into()),
        );
        let orch = orchestrator(fetcher, MockCrawlStore::new());
        let result = orch.run("fantasy").await;
        assert!(!result.success);
        assert_eq!(result.books_crawled, 0);
        assert_eq!(result.failure_kind, Some(ErrorKind::Transient));
    }

    #[tokio::test]
    async fn duplicate_book_ids_fetch_once() {
        // 2 rankings, 5 total book references, 1 shared id: 4 detail fetches.
        let page = ranking_page_payload(&[
            ("r1", &["b1", "b2", "b3"]),
            ("r2", &["b2", "b4"]),
        ]);
        let fetcher = MockFetcher::new()
            .respond("https://api.test/rank/fantasy", page)
            .with_default_book();
        let orch = orchestrator(fetcher.clone(), MockCrawlStore::new());

        let result = orch.run("fantasy").await;
        assert!(result.success);
        assert_eq!(result.books_crawled, 4);

        let detail_calls = fetcher
            .calls()
            .iter()
            .filter(|url| url.contains("/book/"))
            .count();
        assert_eq!(detail_calls, 4);
    }

    #[tokio::test]
    async fn failed_detail_fetch_is_non_fatal() {
        let page = ranking_page_payload(&[("r1", &["b1", "b2", "b3", "b4"])]);
        let fetcher = MockFetcher::new()
            .respond("https://api.test/rank/fantasy", page)
            .respond_err(
                "https://api.test/book/b3",
                AppError::Http {
                    status: 404,
                    url: "https://api.test/book/b3".into(),
                },
            )
            .with_default_book();
        let store = MockCrawlStore::new();
        let orch = orchestrator(fetcher, store.clone());

        let result = orch.run("fantasy").await;
        assert!(result.success);
        assert_eq!(result.books_crawled, 3);

        let snapshots = store.committed_book_snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 3);
        assert!(!snapshots.iter().any(|s| s.book_id == "b3"));

        // The failed book also drops out of the ranking snapshots.
        let rank_snaps = store.committed_ranking_snapshots.lock().unwrap();
        assert!(!rank_snaps.iter().any(|s| s.book_id == "b3"));
        assert_eq!(rank_snaps.len(), 3);
    }

    #[tokio::test]
    async fn storage_failure_rolls_back_everything() {
        let page = ranking_page_payload(&[("r1", &["b1", "b2"])]);
        let fetcher = MockFetcher::new()
            .respond("https://api.test/rank/fantasy", page)
            .with_default_book();
        let store = MockCrawlStore::new().fail_commit();
        let orch = orchestrator(fetcher, store.clone());

        let result = orch.run("fantasy").await;
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(ErrorKind::Storage));

        assert!(store.committed_books.lock().unwrap().is_empty());
        assert!(store.committed_book_snapshots.lock().unwrap().is_empty());
        assert!(store.committed_ranking_snapshots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_write_failure_triggers_rollback() {
        let page = ranking_page_payload(&[("r1", &["b1"])]);
        let fetcher = MockFetcher::new()
            .respond("https://api.test/rank/fantasy", page)
            .with_default_book();
        let store = MockCrawlStore::new().fail_book_snapshots();
        let orch = orchestrator(fetcher, store.clone());

        let result = orch.run("fantasy").await;
        assert!(!result.success);
        assert_eq!(*store.rollbacks.lock().unwrap(), 1);
        assert!(store.committed_books.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persists_rankings_books_and_positions() {
        let page = ranking_page_payload(&[("r1", &["b1", "b2"])]);
        let fetcher = MockFetcher::new()
            .respond("https://api.test/rank/fantasy", page)
            .with_default_book();
        let store = MockCrawlStore::new();
        let orch = orchestrator(fetcher, store.clone());

        let result = orch.run("fantasy").await;
        assert!(result.success);

        assert_eq!(store.committed_rankings.lock().unwrap().len(), 1);
        assert_eq!(store.committed_books.lock().unwrap().len(), 2);

        let rank_snaps = store.committed_ranking_snapshots.lock().unwrap();
        let positions: Vec<u32> = {
            let mut p: Vec<u32> = rank_snaps.iter().map(|s| s.position).collect();
            p.sort();
            p
        };
        assert_eq!(positions, vec![1, 2]);
    }

    #[tokio::test]
    async fn rerun_refetches_previously_persisted_books() {
        // Dedup is session-scoped only: a second run fetches everything again.
        let page = ranking_page_payload(&[("r1", &["b1"])]);
        let fetcher = MockFetcher::new()
            .respond("https://api.test/rank/fantasy", page.clone())
            .respond("https://api.test/rank/fantasy", page)
            .with_default_book();
        let store = MockCrawlStore::new();
        let orch = orchestrator(fetcher.clone(), store.clone());

        assert!(orch.run("fantasy").await.success);
        assert!(orch.run("fantasy").await.success);

        let detail_calls = fetcher
            .calls()
            .iter()
            .filter(|url| url.ends_with("/book/b1"))
            .count();
        assert_eq!(detail_calls, 2);
        assert_eq!(store.committed_book_snapshots.lock().unwrap().len(), 2);
    }
}
