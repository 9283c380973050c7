use std::future::Future;

use crate::error::AppError;
use crate::models::{
    BookInfo, BookRef, BookSnapshot, RankingInfo, RankingRef, RankingSnapshot, TypedRecord,
};

/// Fetches one JSON payload from a URL, with whatever resilience the
/// implementation provides (retries, circuit breaking, throttling).
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str)
    -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Context handed to the parser alongside a raw payload.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    pub task_id: String,
    /// Detail URL template with a `{book_id}` placeholder, used to turn
    /// book references into nested detail fetches.
    pub detail_url_template: Option<String>,
}

impl ParseContext {
    pub fn detail_url(&self, book_id: &str) -> Option<String> {
        self.detail_url_template
            .as_ref()
            .map(|t| t.replace("{book_id}", book_id))
    }
}

/// Turns a raw JSON payload into typed records.
///
/// Shape discrimination (list-of-rankings, single ranking, single book)
/// is entirely the parser's responsibility.
pub trait Parser: Send + Sync + Clone {
    fn parse(
        &self,
        payload: &serde_json::Value,
        ctx: &ParseContext,
    ) -> Result<Vec<TypedRecord>, AppError>;
}

/// Transactional persistence for crawl output.
///
/// One transaction per crawl task: the orchestrator calls `begin` once,
/// issues every write against the returned `Tx`, then either `commit`s
/// everything or `rollback`s on the first storage error.
pub trait CrawlStore: Send + Sync + Clone {
    type Tx: Send;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, AppError>> + Send;

    fn create_or_update_book(
        &self,
        tx: &mut Self::Tx,
        book: &BookInfo,
    ) -> impl Future<Output = Result<BookRef, AppError>> + Send;

    fn create_or_update_ranking(
        &self,
        tx: &mut Self::Tx,
        ranking: &RankingInfo,
    ) -> impl Future<Output = Result<RankingRef, AppError>> + Send;

    fn batch_create_book_snapshots(
        &self,
        tx: &mut Self::Tx,
        snapshots: &[BookSnapshot],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn batch_create_ranking_snapshots(
        &self,
        tx: &mut Self::Tx,
        snapshots: &[RankingSnapshot],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<(), AppError>> + Send;

    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op CrawlStore for dry runs where persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullCrawlStore;

impl CrawlStore for NullCrawlStore {
    type Tx = ();

    async fn begin(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn create_or_update_book(
        &self,
        _tx: &mut (),
        _book: &BookInfo,
    ) -> Result<BookRef, AppError> {
        Ok(BookRef(uuid::Uuid::nil()))
    }

    async fn create_or_update_ranking(
        &self,
        _tx: &mut (),
        _ranking: &RankingInfo,
    ) -> Result<RankingRef, AppError> {
        Ok(RankingRef(uuid::Uuid::nil()))
    }

    async fn batch_create_book_snapshots(
        &self,
        _tx: &mut (),
        _snapshots: &[BookSnapshot],
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn batch_create_ranking_snapshots(
        &self,
        _tx: &mut (),
        _snapshots: &[RankingSnapshot],
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn commit(&self, _tx: ()) -> Result<(), AppError> {
        Ok(())
    }

    async fn rollback(&self, _tx: ()) -> Result<(), AppError> {
        Ok(())
    }
}
