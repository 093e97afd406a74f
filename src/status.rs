use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Pool, Sqlite, Type};

/// Lifecycle of one restaurant inside a pipeline run. Within a run the
/// status only ever moves forward: pending, then processing, then one of
/// the two terminal states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RestaurantStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl RestaurantStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RestaurantStatus::Pending => "pending",
            RestaurantStatus::Processing => "processing",
            RestaurantStatus::Succeeded => "succeeded",
            RestaurantStatus::Failed => "failed",
        }
    }

    const fn rank(&self) -> i64 {
        match self {
            RestaurantStatus::Pending => 0,
            RestaurantStatus::Processing => 1,
            RestaurantStatus::Succeeded | RestaurantStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StatusRecord {
    pub restaurant_id: String,
    pub run_id: String,
    pub status: RestaurantStatus,
    pub detail: Option<String>,
    pub chunk_count: i64,
    pub started_at: i64,
    pub updated_at: i64,
}

/// SQLite-backed status records, shared by pipeline workers and the
/// status CLI. Terminal rows survive process restarts, which is what
/// lets the dashboard tell "build failed" apart from "never built".
pub struct StatusBoard {
    pool: Pool<Sqlite>,
}

impl StatusBoard {
    pub async fn new(db_path: &str) -> Result<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(db_path)?
            .busy_timeout(std::time::Duration::from_secs(30))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = sqlx::SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS restaurant_status (
                restaurant_id TEXT PRIMARY KEY NOT NULL,
                run_id TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_restaurant_status_status ON restaurant_status(status)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Creates or resets the row for a new run: status back to pending,
    /// counters cleared, run id replaced.
    pub async fn register(&self, restaurant_id: &str, run_id: &str) -> Result<StatusRecord> {
        let now = Utc::now().timestamp();
        let record = sqlx::query_as::<_, StatusRecord>(
            r#"
            INSERT INTO restaurant_status
                (restaurant_id, run_id, status, detail, chunk_count, started_at, updated_at)
            VALUES (?, ?, ?, NULL, 0, ?, ?)
            ON CONFLICT(restaurant_id) DO UPDATE SET
                run_id = excluded.run_id,
                status = excluded.status,
                detail = NULL,
                chunk_count = 0,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(restaurant_id)
        .bind(run_id)
        .bind(RestaurantStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Atomically moves a pending row to processing. Returns false when
    /// another worker already holds the restaurant, so at most one build
    /// runs per restaurant per run.
    pub async fn claim(&self, restaurant_id: &str, run_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let already_processing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM restaurant_status
             WHERE restaurant_id = ? AND run_id = ? AND status = 'processing'",
        )
        .bind(restaurant_id)
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;

        if already_processing > 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let now = Utc::now().timestamp();
        let updated = sqlx::query(
            "UPDATE restaurant_status SET status = 'processing', updated_at = ?
             WHERE restaurant_id = ? AND run_id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(restaurant_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated.rows_affected() == 1)
    }

    /// Applies a forward transition; a write that would move the row
    /// backwards (for example processing after succeeded) is ignored.
    /// Returns whether the row changed.
    pub async fn advance(
        &self,
        restaurant_id: &str,
        run_id: &str,
        status: RestaurantStatus,
        detail: Option<&str>,
        chunk_count: i64,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let updated = sqlx::query(
            r#"
            UPDATE restaurant_status
               SET status = ?, detail = ?, chunk_count = ?, updated_at = ?
             WHERE restaurant_id = ? AND run_id = ?
               AND (CASE status
                        WHEN 'pending' THEN 0
                        WHEN 'processing' THEN 1
                        ELSE 2
                    END) < ?
            "#,
        )
        .bind(status.as_str())
        .bind(detail)
        .bind(chunk_count)
        .bind(now)
        .bind(restaurant_id)
        .bind(run_id)
        .bind(status.rank())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    pub async fn get(&self, restaurant_id: &str) -> Result<Option<StatusRecord>> {
        let record = sqlx::query_as::<_, StatusRecord>(
            "SELECT * FROM restaurant_status WHERE restaurant_id = ?",
        )
        .bind(restaurant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<StatusRecord>> {
        let records = sqlx::query_as::<_, StatusRecord>(
            "SELECT * FROM restaurant_status ORDER BY restaurant_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every test gets its own file-backed database; pooled connections to
    // sqlite::memory: would each see a separate empty database.
    async fn temp_board() -> (tempfile::TempDir, StatusBoard) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = format!("sqlite:{}/status.db", dir.path().display());
        let board = StatusBoard::new(&db_path).await.unwrap();
        (dir, board)
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let (_dir, board) = temp_board().await;

        let record = board.register("biz-1", "run-a").await.unwrap();
        assert_eq!(record.status, RestaurantStatus::Pending);
        assert_eq!(record.run_id, "run-a");
        assert_eq!(record.chunk_count, 0);

        let fetched = board.get("biz-1").await.unwrap().unwrap();
        assert_eq!(fetched.restaurant_id, "biz-1");
        assert!(board.get("biz-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_moves_pending_to_processing_once() {
        let (_dir, board) = temp_board().await;
        board.register("biz-1", "run-a").await.unwrap();

        assert!(board.claim("biz-1", "run-a").await.unwrap());
        let record = board.get("biz-1").await.unwrap().unwrap();
        assert_eq!(record.status, RestaurantStatus::Processing);

        // second claim loses
        assert!(!board.claim("biz-1", "run-a").await.unwrap());
    }

    #[tokio::test]
    async fn statuses_never_move_backwards() {
        let (_dir, board) = temp_board().await;
        board.register("biz-1", "run-a").await.unwrap();
        board.claim("biz-1", "run-a").await.unwrap();

        assert!(board
            .advance("biz-1", "run-a", RestaurantStatus::Succeeded, None, 12)
            .await
            .unwrap());

        // late writes from a stalled worker are ignored
        assert!(!board
            .advance("biz-1", "run-a", RestaurantStatus::Processing, None, 0)
            .await
            .unwrap());
        assert!(!board
            .advance("biz-1", "run-a", RestaurantStatus::Failed, Some("late"), 0)
            .await
            .unwrap());

        let record = board.get("biz-1").await.unwrap().unwrap();
        assert_eq!(record.status, RestaurantStatus::Succeeded);
        assert_eq!(record.chunk_count, 12);
        assert_eq!(record.detail, None);
    }

    #[tokio::test]
    async fn failures_keep_their_detail() {
        let (_dir, board) = temp_board().await;
        board.register("biz-1", "run-a").await.unwrap();
        board.claim("biz-1", "run-a").await.unwrap();

        board
            .advance(
                "biz-1",
                "run-a",
                RestaurantStatus::Failed,
                Some("embedding service error: connection refused"),
                0,
            )
            .await
            .unwrap();

        let record = board.get("biz-1").await.unwrap().unwrap();
        assert_eq!(record.status, RestaurantStatus::Failed);
        assert!(record.detail.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn a_new_run_resets_terminal_rows() {
        let (_dir, board) = temp_board().await;
        board.register("biz-1", "run-a").await.unwrap();
        board.claim("biz-1", "run-a").await.unwrap();
        board
            .advance("biz-1", "run-a", RestaurantStatus::Succeeded, None, 7)
            .await
            .unwrap();

        let record = board.register("biz-1", "run-b").await.unwrap();
        assert_eq!(record.status, RestaurantStatus::Pending);
        assert_eq!(record.run_id, "run-b");
        assert_eq!(record.chunk_count, 0);
    }

    #[tokio::test]
    async fn list_orders_by_restaurant() {
        let (_dir, board) = temp_board().await;
        board.register("biz-b", "run-a").await.unwrap();
        board.register("biz-a", "run-a").await.unwrap();

        let records = board.list().await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.restaurant_id.as_str()).collect();
        assert_eq!(ids, vec!["biz-a", "biz-b"]);
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one_worker() {
        use std::sync::Arc;

        // file-backed database so WAL mode applies across connections
        let dir = tempfile::tempdir().unwrap();
        let db_path = format!("sqlite:{}/status.db", dir.path().display());
        let board = Arc::new(StatusBoard::new(&db_path).await.unwrap());
        board.register("biz-1", "run-a").await.unwrap();

        let mut handles = vec![];
        for _ in 0..10 {
            let board = board.clone();
            handles.push(tokio::spawn(
                async move { board.claim("biz-1", "run-a").await },
            ));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(true) => winners += 1,
                Ok(false) => {}
                // lock timeouts under heavy contention count as losses
                Err(err) => eprintln!("claim attempt errored: {err}"),
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent claim may win");

        let record = board.get("biz-1").await.unwrap().unwrap();
        assert_eq!(record.status, RestaurantStatus::Processing);
    }
}
