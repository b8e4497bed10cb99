//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{ChunkRepo, GcRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: ChunkRepo + GcRepo + Send + Sync {
    /// Create tables and indexes if missing.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    /// Queries slower than this are logged. SQLite cannot cancel them.
    slow_query: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: every write is serialized, and a transaction sees no
        // interleaved writes from other tasks.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            slow_query: Duration::from_secs(query_timeout_secs.unwrap_or(600)),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    fn note_duration(&self, operation: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.slow_query {
            tracing::warn!(
                operation,
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = self.slow_query.as_millis() as u64,
                "slow metadata query"
            );
        }
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{ChunkInsert, ChunkStats, GcRunState, RefOutcome};
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl ChunkRepo for SqliteStore {
        async fn upsert_chunk(
            &self,
            chunk_hash: &str,
            size_bytes: i64,
            quota: Option<i64>,
        ) -> MetadataResult<ChunkInsert> {
            let now = OffsetDateTime::now_utc();
            // SQLite needs the WHERE clause to parse INSERT ... SELECT ... ON CONFLICT.
            let inserted = sqlx::query(
                r#"
                INSERT INTO chunks (chunk_hash, size_bytes, created_at, last_accessed_at)
                SELECT ?, ?, ?, ?
                WHERE ? IS NULL
                   OR (SELECT COALESCE(SUM(size_bytes), 0) FROM chunks) + ? <= ?
                ON CONFLICT(chunk_hash) DO NOTHING
                "#,
            )
            .bind(chunk_hash)
            .bind(size_bytes)
            .bind(now)
            .bind(now)
            .bind(quota)
            .bind(size_bytes)
            .bind(quota)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() > 0 {
                return Ok(ChunkInsert::Inserted);
            }
            let touched = sqlx::query("UPDATE chunks SET last_accessed_at = ? WHERE chunk_hash = ?")
                .bind(now)
                .bind(chunk_hash)
                .execute(&self.pool)
                .await?;
            Ok(if touched.rows_affected() > 0 {
                ChunkInsert::Existed
            } else {
                ChunkInsert::OverQuota
            })
        }

        async fn get_chunk(&self, chunk_hash: &str) -> MetadataResult<Option<ChunkRow>> {
            let row = sqlx::query_as::<_, ChunkRow>("SELECT * FROM chunks WHERE chunk_hash = ?")
                .bind(chunk_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn add_ref(
            &self,
            chunk_hash: &str,
            upload_id: Uuid,
            position: i64,
        ) -> MetadataResult<RefOutcome> {
            let mut tx = self.pool.begin().await?;

            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT chunk_hash FROM chunk_refs WHERE upload_id = ? AND position = ?",
            )
            .bind(upload_id)
            .bind(position)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((current,)) = existing {
                tx.rollback().await?;
                if current == chunk_hash {
                    return Ok(RefOutcome::AlreadyPresent);
                }
                return Err(MetadataError::Constraint(format!(
                    "upload {upload_id} position {position} already references chunk {current}"
                )));
            }

            let result = sqlx::query(
                r#"
                INSERT INTO chunk_refs (chunk_hash, upload_id, position, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(chunk_hash)
            .bind(upload_id)
            .bind(position)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {
                    tx.commit().await?;
                    Ok(RefOutcome::Added)
                }
                Err(sqlx::Error::Database(db_err))
                    if db_err.message().contains("FOREIGN KEY constraint") =>
                {
                    Err(MetadataError::NotFound(format!("chunk {chunk_hash}")))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn remove_refs(&self, chunk_hash: &str, upload_id: Uuid) -> MetadataResult<u64> {
            let result =
                sqlx::query("DELETE FROM chunk_refs WHERE chunk_hash = ? AND upload_id = ?")
                    .bind(chunk_hash)
                    .bind(upload_id)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        }

        async fn remove_ref_at(
            &self,
            chunk_hash: &str,
            upload_id: Uuid,
            position: i64,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM chunk_refs WHERE chunk_hash = ? AND upload_id = ? AND position = ?",
            )
            .bind(chunk_hash)
            .bind(upload_id)
            .bind(position)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn remove_refs_from(&self, upload_id: Uuid, position: i64) -> MetadataResult<u64> {
            let result =
                sqlx::query("DELETE FROM chunk_refs WHERE upload_id = ? AND position >= ?")
                    .bind(upload_id)
                    .bind(position)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        }

        async fn refcount(&self, chunk_hash: &str) -> MetadataResult<u64> {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM chunk_refs WHERE chunk_hash = ?")
                    .bind(chunk_hash)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(count as u64)
        }

        async fn refcount_for_upload(
            &self,
            chunk_hash: &str,
            upload_id: Uuid,
        ) -> MetadataResult<u64> {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM chunk_refs WHERE chunk_hash = ? AND upload_id = ?",
            )
            .bind(chunk_hash)
            .bind(upload_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        }

        async fn list_unreferenced(&self, limit: u32) -> MetadataResult<Vec<ChunkRow>> {
            let started = Instant::now();
            let rows = sqlx::query_as::<_, ChunkRow>(
                r#"
                SELECT * FROM chunks
                WHERE NOT EXISTS (
                    SELECT 1 FROM chunk_refs r WHERE r.chunk_hash = chunks.chunk_hash
                )
                ORDER BY created_at
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            self.note_duration("list_unreferenced", started);
            Ok(rows)
        }

        async fn delete_if_unreferenced(&self, chunk_hash: &str) -> MetadataResult<bool> {
            // A single statement, so the reference check and the delete are atomic.
            let result = sqlx::query(
                r#"
                DELETE FROM chunks
                WHERE chunk_hash = ?
                  AND NOT EXISTS (SELECT 1 FROM chunk_refs r WHERE r.chunk_hash = ?)
                "#,
            )
            .bind(chunk_hash)
            .bind(chunk_hash)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_stats(&self) -> MetadataResult<ChunkStats> {
            let started = Instant::now();
            let (count, total_size): (i64, i64) =
                sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM chunks")
                    .fetch_one(&self.pool)
                    .await?;

            let (referenced,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM chunks WHERE EXISTS (SELECT 1 FROM chunk_refs r WHERE r.chunk_hash = chunks.chunk_hash)",
            )
            .fetch_one(&self.pool)
            .await?;
            self.note_duration("get_stats", started);

            Ok(ChunkStats {
                count: count as u64,
                total_size: total_size as u64,
                referenced_count: referenced as u64,
                unreferenced_count: (count - referenced) as u64,
            })
        }
    }

    #[async_trait]
    impl GcRepo for SqliteStore {
        async fn begin_gc_run(&self, run_id: Uuid, dry_run: bool) -> MetadataResult<()> {
            match sqlx::query(
                r#"
                INSERT INTO gc_runs (run_id, state, dry_run, started_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(GcRunState::Running.as_str())
            .bind(dry_run)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await
            {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db_err))
                    if db_err.message().contains("UNIQUE constraint")
                        && db_err.message().contains("gc_runs") =>
                {
                    Err(MetadataError::Constraint(
                        "another GC run is already active".to_string(),
                    ))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn finish_gc_run(
            &self,
            run_id: Uuid,
            state: GcRunState,
            stats_json: Option<&str>,
            error: Option<&str>,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE gc_runs SET state = ?, finished_at = ?, stats_json = ?, error = ? WHERE run_id = ?",
            )
            .bind(state.as_str())
            .bind(OffsetDateTime::now_utc())
            .bind(stats_json)
            .bind(error)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("gc run {run_id}")));
            }
            Ok(())
        }

        async fn get_gc_run(&self, run_id: Uuid) -> MetadataResult<Option<GcRunRow>> {
            let row = sqlx::query_as::<_, GcRunRow>("SELECT * FROM gc_runs WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn recent_gc_runs(&self, limit: u32) -> MetadataResult<Vec<GcRunRow>> {
            let rows = sqlx::query_as::<_, GcRunRow>(
                "SELECT * FROM gc_runs ORDER BY started_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn fail_orphaned_gc_runs(&self) -> MetadataResult<u64> {
            let result = sqlx::query(
                "UPDATE gc_runs SET state = ?, finished_at = ?, error = ? WHERE state = ?",
            )
            .bind(GcRunState::Failed.as_str())
            .bind(OffsetDateTime::now_utc())
            .bind("interrupted by restart")
            .bind(GcRunState::Running.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    chunk_hash TEXT PRIMARY KEY,
    size_bytes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_chunks_created ON chunks(created_at);

-- One row per (upload, position); a chunk's refcount is its row count.
CREATE TABLE IF NOT EXISTS chunk_refs (
    chunk_hash TEXT NOT NULL REFERENCES chunks(chunk_hash),
    upload_id BLOB NOT NULL,
    position INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (upload_id, position)
);
CREATE INDEX IF NOT EXISTS idx_chunk_refs_hash ON chunk_refs(chunk_hash, upload_id);

CREATE TABLE IF NOT EXISTS gc_runs (
    run_id BLOB PRIMARY KEY,
    state TEXT NOT NULL,
    dry_run INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    stats_json TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_gc_runs_started ON gc_runs(started_at);
-- At most one running collector.
CREATE UNIQUE INDEX IF NOT EXISTS idx_gc_runs_single_running
ON gc_runs(state) WHERE state = 'running';
"#;
