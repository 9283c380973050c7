use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::normalize_count;

/// A nested detail-fetch request emitted by the parser for a book
/// referenced on a ranking or catalog page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailFetch {
    pub book_id: String,
    pub url: String,
}

/// A typed record produced by the parser from one raw payload.
///
/// Page and Ranking records carry the detail fetches derived from the
/// book references they contain. Records are never persisted directly;
/// the orchestrator translates them into storage calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "lowercase")]
pub enum TypedRecord {
    Page {
        payload: serde_json::Value,
        nested: Vec<DetailFetch>,
    },
    Ranking {
        payload: serde_json::Value,
        nested: Vec<DetailFetch>,
    },
    Book {
        payload: serde_json::Value,
    },
}

impl TypedRecord {
    /// Detail fetches carried by this record (empty for Book records).
    pub fn nested(&self) -> &[DetailFetch] {
        match self {
            TypedRecord::Page { nested, .. } | TypedRecord::Ranking { nested, .. } => nested,
            TypedRecord::Book { .. } => &[],
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            TypedRecord::Page { payload, .. }
            | TypedRecord::Ranking { payload, .. }
            | TypedRecord::Book { payload } => payload,
        }
    }
}

/// A crawl task resolved from configuration at orchestration start.
/// Immutable for the lifetime of the task.
#[derive(Debug, Clone)]
pub struct CrawlTask {
    pub task_id: String,
    pub url: String,
    pub params: Vec<(String, String)>,
}

/// Outcome of one `CrawlOrchestrator::run` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlResult {
    pub success: bool,
    pub task_id: String,
    pub books_crawled: usize,
    pub execution_time: std::time::Duration,
    pub error: Option<String>,
    /// Classification of the failure, for the job-level retry predicate.
    #[serde(skip)]
    pub failure_kind: Option<crate::error::ErrorKind>,
}

impl CrawlResult {
    pub fn succeeded(task_id: &str, books_crawled: usize, elapsed: std::time::Duration) -> Self {
        Self {
            success: true,
            task_id: task_id.to_string(),
            books_crawled,
            execution_time: elapsed,
            error: None,
            failure_kind: None,
        }
    }

    pub fn failed(task_id: &str, error: &crate::error::AppError, elapsed: std::time::Duration) -> Self {
        Self {
            success: false,
            task_id: task_id.to_string(),
            books_crawled: 0,
            execution_time: elapsed,
            error: Some(error.to_string()),
            failure_kind: Some(error.kind()),
        }
    }
}

/// Upstream book metadata, numeric fields already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookInfo {
    pub book_id: String,
    pub title: String,
    pub author: String,
    pub status: Option<String>,
    pub word_count: u64,
}

/// Ranking metadata for one ranking list on a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingInfo {
    pub ranking_id: String,
    pub name: String,
    pub channel: Option<String>,
}

/// One time-stamped observation of a book's mutable metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub book_id: String,
    pub clicks: u64,
    pub favorites: u64,
    pub comments: u64,
    pub word_count: u64,
    pub captured_at: DateTime<Utc>,
}

/// One time-stamped observation of a book's position on a ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub ranking_id: String,
    pub book_id: String,
    pub position: u32,
    pub captured_at: DateTime<Utc>,
}

/// Storage handle for an upserted book row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookRef(pub Uuid);

/// Storage handle for an upserted ranking row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingRef(pub Uuid);

impl BookInfo {
    /// Build from a raw detail payload. Missing text fields fall back to
    /// empty strings; numeric fields go through the tolerant normalizer.
    pub fn from_payload(book_id: &str, payload: &serde_json::Value) -> Self {
        Self {
            book_id: book_id.to_string(),
            title: str_field(payload, "title"),
            author: str_field(payload, "author"),
            status: payload
                .get("status")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            word_count: normalize_count(payload.get("word_count")),
        }
    }
}

impl BookSnapshot {
    pub fn from_payload(
        book_id: &str,
        payload: &serde_json::Value,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            book_id: book_id.to_string(),
            clicks: normalize_count(payload.get("clicks")),
            favorites: normalize_count(payload.get("favorites")),
            comments: normalize_count(payload.get("comments")),
            word_count: normalize_count(payload.get("word_count")),
            captured_at,
        }
    }
}

impl RankingInfo {
    /// Build from a ranking record payload. Returns `None` when the
    /// payload has no usable ranking id.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        let ranking_id = payload.get("rank_id").and_then(|v| v.as_str())?;
        Some(Self {
            ranking_id: ranking_id.to_string(),
            name: str_field(payload, "name"),
            channel: payload
                .get("channel")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

fn str_field(payload: &serde_json::Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_info_from_payload() {
        let payload = serde_json::json!({
            "title": "The Long Road",
            "author": "anon",
            "status": "ongoing",
            "word_count": "85,221(avg/chapter)"
        });
        let info = BookInfo::from_payload("b-1", &payload);
        assert_eq!(info.title, "The Long Road");
        assert_eq!(info.word_count, 85221);
        assert_eq!(info.status.as_deref(), Some("ongoing"));
    }

    #[test]
    fn test_book_info_tolerates_missing_fields() {
        let info = BookInfo::from_payload("b-2", &serde_json::json!({}));
        assert_eq!(info.title, "");
        assert_eq!(info.word_count, 0);
        assert!(info.status.is_none());
    }

    #[test]
    fn test_ranking_info_requires_id() {
        assert!(RankingInfo::from_payload(&serde_json::json!({"name": "hot"})).is_none());
        let info =
            RankingInfo::from_payload(&serde_json::json!({"rank_id": "r1", "name": "hot"}))
                .unwrap();
        assert_eq!(info.ranking_id, "r1");
    }

    #[test]
    fn test_nested_records() {
        let rec = TypedRecord::Ranking {
            payload: serde_json::json!({"rank_id": "r1"}),
            nested: vec![DetailFetch {
                book_id: "b1".into(),
                url: "https://example.com/book/b1".into(),
            }],
        };
        assert_eq!(rec.nested().len(), 1);

        let book = TypedRecord::Book {
            payload: serde_json::json!({}),
        };
        assert!(book.nested().is_empty());
    }
}
