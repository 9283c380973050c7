//! Platform payload parsing: JSON envelope to typed records.
//!
//! The platform wraps every response in an envelope whose `code` field
//! signals success. The `data` payload comes in three shapes, and shape
//! discrimination happens here, not in the orchestrator:
//!
//! - a list of ranking objects, each carrying its book references;
//! - a single ranking object with a book list;
//! - a single book detail object.

use demeter_core::error::AppError;
use demeter_core::models::{DetailFetch, TypedRecord};
use demeter_core::traits::{ParseContext, Parser};

const ENVELOPE_OK: i64 = 200;

/// Parser for the platform's JSON envelope format.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeParser;

impl EnvelopeParser {
    pub fn new() -> Self {
        Self
    }

    fn unwrap_envelope<'a>(
        &self,
        payload: &'a serde_json::Value,
    ) -> Result<&'a serde_json::Value, AppError> {
        let code = payload
            .get("code")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| AppError::Parse("envelope has no status code field".into()))?;
        if code != ENVELOPE_OK {
            let message = payload
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("no message");
            return Err(AppError::Parse(format!(
                "platform reported error code {code}: {message}"
            )));
        }
        payload
            .get("data")
            .ok_or_else(|| AppError::Parse("envelope has no data payload".into()))
    }

    fn ranking_record(
        &self,
        ranking: &serde_json::Value,
        ctx: &ParseContext,
    ) -> TypedRecord {
        let nested = ranking
            .get("books")
            .and_then(|v| v.as_array())
            .map(|books| {
                books
                    .iter()
                    .filter_map(|book| book.get("book_id").and_then(|v| v.as_str()))
                    .filter_map(|book_id| {
                        let Some(url) = ctx.detail_url(book_id) else {
                            tracing::debug!(
                                book_id,
                                task_id = %ctx.task_id,
                                "No detail template configured, skipping fan-out"
                            );
                            return None;
                        };
                        Some(DetailFetch {
                            book_id: book_id.to_string(),
                            url,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        TypedRecord::Ranking {
            payload: ranking.clone(),
            nested,
        }
    }
}

impl Parser for EnvelopeParser {
    fn parse(
        &self,
        payload: &serde_json::Value,
        ctx: &ParseContext,
    ) -> Result<Vec<TypedRecord>, AppError> {
        let data = self.unwrap_envelope(payload)?;

        // Shape 1: a list of rankings.
        if let Some(rankings) = data.as_array() {
            return Ok(rankings
                .iter()
                .map(|ranking| self.ranking_record(ranking, ctx))
                .collect());
        }

        if let Some(object) = data.as_object() {
            // Shape 2: a single ranking with its book list.
            if object.contains_key("books") || object.contains_key("rank_id") {
                return Ok(vec![self.ranking_record(data, ctx)]);
            }
            // Shape 3: a single book detail object.
            if object.contains_key("book_id") || object.contains_key("title") {
                return Ok(vec![TypedRecord::Book {
                    payload: data.clone(),
                }]);
            }
        }

        Err(AppError::Parse("unrecognized data payload shape".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ParseContext {
        ParseContext {
            task_id: "fantasy".into(),
            detail_url_template: Some("https://api.test/book/{book_id}".into()),
        }
    }

    #[test]
    fn parses_ranking_list() {
        let payload = serde_json::json!({
            "code": 200,
            "data": [
                {
                    "rank_id": "hot",
                    "name": "Hot list",
                    "books": [
                        {"book_id": "101", "position": 1},
                        {"book_id": "102", "position": 2}
                    ]
                },
                {
                    "rank_id": "new",
                    "name": "New arrivals",
                    "books": [{"book_id": "101", "position": 1}]
                }
            ]
        });

        let records = EnvelopeParser::new().parse(&payload, &ctx()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].nested().len(), 2);
        assert_eq!(
            records[0].nested()[0].url,
            "https://api.test/book/101"
        );
        // Cross-ranking duplicates are the orchestrator's concern, not ours.
        assert_eq!(records[1].nested()[0].book_id, "101");
    }

    #[test]
    fn parses_single_ranking() {
        let payload = serde_json::json!({
            "code": 200,
            "data": {
                "rank_id": "hot",
                "name": "Hot list",
                "books": [{"book_id": "7"}]
            }
        });

        let records = EnvelopeParser::new().parse(&payload, &ctx()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], TypedRecord::Ranking { .. }));
        assert_eq!(records[0].nested().len(), 1);
    }

    #[test]
    fn parses_single_book() {
        let payload = serde_json::json!({
            "code": 200,
            "data": {
                "book_id": "7",
                "title": "A Book",
                "clicks": "85,221(avg/chapter)"
            }
        });

        let records = EnvelopeParser::new().parse(&payload, &ctx()).unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            TypedRecord::Book { payload } => {
                assert_eq!(payload["title"], "A Book");
            }
            other => panic!("expected Book record, got {other:?}"),
        }
    }

    #[test]
    fn error_code_envelope_fails() {
        let payload = serde_json::json!({
            "code": 500,
            "message": "internal",
            "data": null
        });
        let err = EnvelopeParser::new().parse(&payload, &ctx()).unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn missing_code_fails() {
        let payload = serde_json::json!({"data": []});
        assert!(EnvelopeParser::new().parse(&payload, &ctx()).is_err());
    }

    #[test]
    fn unknown_shape_fails() {
        let payload = serde_json::json!({"code": 200, "data": 42});
        assert!(EnvelopeParser::new().parse(&payload, &ctx()).is_err());
    }

    #[test]
    fn no_detail_template_skips_fanout() {
        let payload = serde_json::json!({
            "code": 200,
            "data": [{"rank_id": "hot", "books": [{"book_id": "1"}]}]
        });
        let bare_ctx = ParseContext {
            task_id: "fantasy".into(),
            detail_url_template: None,
        };
        let records = EnvelopeParser::new().parse(&payload, &bare_ctx).unwrap();
        assert!(records[0].nested().is_empty());
    }
}
