use demeter_core::error::AppError;
use demeter_core::models::{
    BookInfo, BookRef, BookSnapshot, RankingInfo, RankingRef, RankingSnapshot,
};
use demeter_core::traits::CrawlStore;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Transactional crawl persistence in PostgreSQL.
///
/// Every write for one crawl task goes through a single transaction; the
/// orchestrator commits or rolls back the whole set.
#[derive(Clone)]
pub struct PgCrawlStore {
    pool: PgPool,
}

impl PgCrawlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::Storage(e.to_string())
}

impl CrawlStore for PgCrawlStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, AppError> {
        self.pool.begin().await.map_err(db_err)
    }

    async fn create_or_update_book(
        &self,
        tx: &mut Self::Tx,
        book: &BookInfo,
    ) -> Result<BookRef, AppError> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO books (book_id, title, author, status, word_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (book_id) DO UPDATE
            SET title = EXCLUDED.title,
                author = EXCLUDED.author,
                status = EXCLUDED.status,
                word_count = EXCLUDED.word_count,
                updated_at = now()
            RETURNING id
            "#,
        )
        .bind(&book.book_id)
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.status)
        .bind(book.word_count as i64)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(BookRef(row.0))
    }

    async fn create_or_update_ranking(
        &self,
        tx: &mut Self::Tx,
        ranking: &RankingInfo,
    ) -> Result<RankingRef, AppError> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO rankings (ranking_id, name, channel)
            VALUES ($1, $2, $3)
            ON CONFLICT (ranking_id) DO UPDATE
            SET name = EXCLUDED.name,
                channel = EXCLUDED.channel,
                updated_at = now()
            RETURNING id
            "#,
        )
        .bind(&ranking.ranking_id)
        .bind(&ranking.name)
        .bind(&ranking.channel)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(RankingRef(row.0))
    }

    async fn batch_create_book_snapshots(
        &self,
        tx: &mut Self::Tx,
        snapshots: &[BookSnapshot],
    ) -> Result<(), AppError> {
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO book_snapshots (id, book_id, clicks, favorites, comments, word_count, captured_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&snapshot.book_id)
            .bind(snapshot.clicks as i64)
            .bind(snapshot.favorites as i64)
            .bind(snapshot.comments as i64)
            .bind(snapshot.word_count as i64)
            .bind(snapshot.captured_at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn batch_create_ranking_snapshots(
        &self,
        tx: &mut Self::Tx,
        snapshots: &[RankingSnapshot],
    ) -> Result<(), AppError> {
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO ranking_snapshots (id, ranking_id, book_id, position, captured_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&snapshot.ranking_id)
            .bind(&snapshot.book_id)
            .bind(snapshot.position as i32)
            .bind(snapshot.captured_at)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), AppError> {
        tx.commit().await.map_err(db_err)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), AppError> {
        tx.rollback().await.map_err(db_err)
    }
}
