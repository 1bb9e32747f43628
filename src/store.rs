use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::{AppError, AppResult};

/// Sentinel for rows no clustering run has touched yet.
pub const CLUSTER_UNPROCESSED: i64 = -2;
/// Sentinel for rows the latest clustering run left unassigned.
pub const CLUSTER_NOISE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }
}

/// A submission as it arrives from the upstream exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubmission {
    pub submission_id: i64,
    pub feedback: String,
    pub program_name: String,
    pub assignment_name: String,
    pub created_at: String,
}

/// A row still waiting for an embedding (or whose last attempt failed).
#[derive(Debug, Clone)]
pub struct PendingFeedback {
    pub id: i64,
    pub submission_id: i64,
    pub feedback: String,
}

/// A persisted cluster together with its live membership count.
#[derive(Debug, Clone)]
pub struct ClusterRow {
    pub cluster_id: i64,
    pub size: i64,
    pub description: Option<String>,
    pub representative_samples: Vec<String>,
}

/// One point of the 2D projection, for chart rendering.
#[derive(Debug, Clone, Serialize)]
pub struct ScatterPoint {
    pub cluster_id: i64,
    pub x: f64,
    pub y: f64,
    pub program_name: String,
    pub feedback: String,
}

/// Snapshot of pipeline progress for the read-only monitor.
#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub clustered: i64,
    pub noise: i64,
    pub num_clusters: i64,
    pub phase: Option<PhaseStats>,
    pub completed_batches: i64,
    pub failed_batches: i64,
    pub avg_batch_secs: f64,
    pub recent_errors: i64,
}

#[derive(Debug, Clone)]
pub struct PhaseStats {
    pub phase: String,
    pub total: i64,
    pub processed: i64,
    pub start_time: OffsetDateTime,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS feedback_embeddings (
        id INTEGER PRIMARY KEY,
        submission_id INTEGER UNIQUE NOT NULL,
        feedback TEXT NOT NULL,
        program_name TEXT NOT NULL,
        assignment_name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        embedding TEXT,
        cluster_id INTEGER NOT NULL DEFAULT -2,
        reduced_2d_x REAL,
        reduced_2d_y REAL,
        processing_status TEXT NOT NULL DEFAULT 'pending',
        error_message TEXT,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_submission_id ON feedback_embeddings(submission_id)",
    "CREATE INDEX IF NOT EXISTS idx_cluster_id ON feedback_embeddings(cluster_id)",
    "CREATE INDEX IF NOT EXISTS idx_status ON feedback_embeddings(processing_status)",
    "CREATE TABLE IF NOT EXISTS clusters (
        cluster_id INTEGER PRIMARY KEY,
        size INTEGER NOT NULL,
        description TEXT,
        representative_samples TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS analysis_metadata (
        id INTEGER PRIMARY KEY,
        analysis_phase TEXT NOT NULL,
        total_samples INTEGER NOT NULL,
        processed_samples INTEGER NOT NULL DEFAULT 0,
        failed_samples INTEGER NOT NULL DEFAULT 0,
        parameters TEXT,
        start_time TEXT NOT NULL,
        end_time TEXT
    )",
    "CREATE TABLE IF NOT EXISTS batch_progress (
        id INTEGER PRIMARY KEY,
        batch_id INTEGER NOT NULL,
        start_idx INTEGER NOT NULL,
        end_idx INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_count INTEGER NOT NULL DEFAULT 0,
        processing_time REAL,
        created_at TEXT NOT NULL
    )",
];

/// Handle to the analysis database. All pipeline stages and the monitor go
/// through this type; no stage opens its own ad hoc connection.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    #[tracing::instrument(name = "Opening analysis database", level = "debug")]
    pub async fn open<P: AsRef<Path> + std::fmt::Debug>(db_path: P) -> AppResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the database alive.
    pub async fn open_in_memory() -> AppResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> AppResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        trace!("Schema ready");
        Ok(())
    }

    /// Upsert submissions keyed on `submission_id`. Re-ingesting an existing
    /// submission updates the text and label columns and leaves every derived
    /// column (embedding, cluster, projection) untouched.
    #[tracing::instrument(name = "Ingesting submissions", level = "debug", skip(self, rows))]
    pub async fn upsert_submissions(&self, rows: &[NewSubmission]) -> AppResult<u64> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO feedback_embeddings
                    (submission_id, feedback, program_name, assignment_name, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(submission_id) DO UPDATE SET
                    feedback = excluded.feedback,
                    program_name = excluded.program_name,
                    assignment_name = excluded.assignment_name,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
            )
            .bind(row.submission_id)
            .bind(&row.feedback)
            .bind(&row.program_name)
            .bind(&row.assignment_name)
            .bind(&row.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    pub async fn total_rows(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feedback_embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Rows the embedding stage still has to handle: never embedded, or whose
    /// last attempt failed. Completed rows are never re-embedded.
    pub async fn embedding_candidates(&self) -> AppResult<Vec<PendingFeedback>> {
        let rows = sqlx::query(
            "SELECT id, submission_id, feedback
             FROM feedback_embeddings
             WHERE embedding IS NULL OR processing_status = 'failed'
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PendingFeedback {
                    id: row.try_get("id")?,
                    submission_id: row.try_get("submission_id")?,
                    feedback: row.try_get("feedback")?,
                })
            })
            .collect()
    }

    /// Persist one successful batch of embeddings. One transaction per batch
    /// so a crash mid-run loses at most the batch in flight.
    pub async fn store_embedded_batch(&self, items: &[(i64, Vec<f32>)]) -> AppResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        for (submission_id, embedding) in items {
            let encoded = serde_json::to_string(embedding)?;
            sqlx::query(
                "UPDATE feedback_embeddings
                 SET embedding = ?, processing_status = 'completed',
                     error_message = NULL, updated_at = ?
                 WHERE submission_id = ?",
            )
            .bind(encoded)
            .bind(now)
            .bind(submission_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mark every item of a failed batch: explicit all-zero sentinel vector
    /// plus the error text. Never a fabricated embedding.
    pub async fn mark_batch_failed(
        &self,
        submission_ids: &[i64],
        dimension: usize,
        error: &str,
    ) -> AppResult<()> {
        let now = OffsetDateTime::now_utc();
        let sentinel = serde_json::to_string(&vec![0.0f32; dimension])?;
        let mut tx = self.pool.begin().await?;
        for submission_id in submission_ids {
            sqlx::query(
                "UPDATE feedback_embeddings
                 SET embedding = ?, processing_status = 'failed',
                     error_message = ?, updated_at = ?
                 WHERE submission_id = ?",
            )
            .bind(&sentinel)
            .bind(error)
            .bind(now)
            .bind(submission_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_batch(
        &self,
        batch_id: i64,
        start_idx: i64,
        end_idx: i64,
        status: ProcessingStatus,
        error_count: i64,
        processing_secs: f64,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO batch_progress
                (batch_id, start_idx, end_idx, status, error_count, processing_time, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(batch_id)
        .bind(start_idx)
        .bind(end_idx)
        .bind(status.as_str())
        .bind(error_count)
        .bind(processing_secs)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn begin_phase(
        &self,
        phase: &str,
        total: i64,
        parameters: &serde_json::Value,
    ) -> AppResult<i64> {
        let result = sqlx::query(
            "INSERT INTO analysis_metadata (analysis_phase, total_samples, parameters, start_time)
             VALUES (?, ?, ?, ?)",
        )
        .bind(phase)
        .bind(total)
        .bind(serde_json::to_string(parameters)?)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_phase_progress(&self, phase_id: i64, processed: i64) -> AppResult<()> {
        sqlx::query("UPDATE analysis_metadata SET processed_samples = ? WHERE id = ?")
            .bind(processed)
            .bind(phase_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish_phase(&self, phase_id: i64, processed: i64, failed: i64) -> AppResult<()> {
        sqlx::query(
            "UPDATE analysis_metadata
             SET processed_samples = ?, failed_samples = ?, end_time = ?
             WHERE id = ?",
        )
        .bind(processed)
        .bind(failed)
        .bind(OffsetDateTime::now_utc())
        .bind(phase_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All successfully embedded rows in id order, decoded from their JSON
    /// column. Failed rows (zero-vector sentinel) are excluded.
    pub async fn embedded_vectors(&self) -> AppResult<Vec<(i64, Vec<f32>)>> {
        let rows = sqlx::query(
            "SELECT id, embedding
             FROM feedback_embeddings
             WHERE embedding IS NOT NULL AND processing_status = 'completed'
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut vectors = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let encoded: String = row.try_get("embedding")?;
            vectors.push((id, serde_json::from_str(&encoded)?));
        }
        Ok(vectors)
    }

    pub async fn embedded_count(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM feedback_embeddings
             WHERE embedding IS NOT NULL AND processing_status = 'completed'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Reset the derived clustering columns ahead of a fresh clustering run.
    pub async fn reset_assignments(&self) -> AppResult<()> {
        sqlx::query(
            "UPDATE feedback_embeddings
             SET cluster_id = ?, reduced_2d_x = NULL, reduced_2d_y = NULL, updated_at = ?",
        )
        .bind(CLUSTER_UNPROCESSED)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply one clustering run's assignments and 2D projection in a single
    /// transaction: (row id, cluster id, x, y).
    pub async fn apply_assignments(&self, assignments: &[(i64, i64, f64, f64)]) -> AppResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        for (id, cluster_id, x, y) in assignments {
            sqlx::query(
                "UPDATE feedback_embeddings
                 SET cluster_id = ?, reduced_2d_x = ?, reduced_2d_y = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(cluster_id)
            .bind(x)
            .bind(y)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Cluster identifiers are not stable across runs, so the clusters table
    /// is regenerated wholesale: delete-all-then-insert.
    pub async fn replace_clusters(&self, seeds: &[(i64, i64, Vec<String>)]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM clusters").execute(&mut *tx).await?;
        for (cluster_id, size, samples) in seeds {
            sqlx::query(
                "INSERT INTO clusters (cluster_id, size, representative_samples)
                 VALUES (?, ?, ?)",
            )
            .bind(cluster_id)
            .bind(size)
            .bind(serde_json::to_string(samples)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_cluster_description(&self, cluster_id: i64, description: &str) -> AppResult<()> {
        sqlx::query("UPDATE clusters SET description = ? WHERE cluster_id = ?")
            .bind(description)
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every materialized cluster with its size recomputed as a live count.
    /// The stored `size` column is never trusted on the read path.
    pub async fn clusters_overview(&self) -> AppResult<Vec<ClusterRow>> {
        let rows = sqlx::query(
            "SELECT c.cluster_id, c.description, c.representative_samples,
                    COUNT(f.id) AS live_size
             FROM clusters c
             LEFT JOIN feedback_embeddings f ON f.cluster_id = c.cluster_id
             GROUP BY c.cluster_id
             ORDER BY live_size DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cluster_from_row).collect()
    }

    /// Member texts of one cluster in id order, for sampling.
    pub async fn cluster_member_texts(&self, cluster_id: i64) -> AppResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT feedback FROM feedback_embeddings WHERE cluster_id = ? ORDER BY id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("feedback")?))
            .collect()
    }

    /// Points of the latest 2D projection, noise included.
    pub async fn scatter_points(&self) -> AppResult<Vec<ScatterPoint>> {
        let rows = sqlx::query(
            "SELECT cluster_id, reduced_2d_x, reduced_2d_y, program_name, feedback
             FROM feedback_embeddings
             WHERE cluster_id >= ? AND reduced_2d_x IS NOT NULL AND reduced_2d_y IS NOT NULL
             ORDER BY id",
        )
        .bind(CLUSTER_NOISE)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ScatterPoint {
                    cluster_id: row.try_get("cluster_id")?,
                    x: row.try_get("reduced_2d_x")?,
                    y: row.try_get("reduced_2d_y")?,
                    program_name: row.try_get("program_name")?,
                    feedback: row.try_get("feedback")?,
                })
            })
            .collect()
    }

    /// (program, cluster, count) triples for the distribution crosstab.
    pub async fn program_crosstab(&self) -> AppResult<Vec<(String, i64, i64)>> {
        let rows = sqlx::query(
            "SELECT program_name, cluster_id, COUNT(*) AS n
             FROM feedback_embeddings
             WHERE cluster_id >= 0
             GROUP BY program_name, cluster_id
             ORDER BY program_name, cluster_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("program_name")?,
                    row.try_get::<i64, _>("cluster_id")?,
                    row.try_get::<i64, _>("n")?,
                ))
            })
            .collect()
    }

    /// Counts of assigned and noise rows among embedded records.
    pub async fn assignment_counts(&self) -> AppResult<(i64, i64)> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN cluster_id >= 0 THEN 1 ELSE 0 END), 0) AS clustered,
                COALESCE(SUM(CASE WHEN cluster_id = ? THEN 1 ELSE 0 END), 0) AS noise
             FROM feedback_embeddings
             WHERE embedding IS NOT NULL AND processing_status = 'completed'",
        )
        .bind(CLUSTER_NOISE)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("clustered")?, row.try_get("noise")?))
    }

    /// Everything the monitor displays, gathered read-only.
    pub async fn monitor_stats(&self) -> AppResult<MonitorStats> {
        let mut stats = MonitorStats::default();

        let overall = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN processing_status = 'completed' THEN 1 ELSE 0 END), 0)
                    AS processed,
                COALESCE(SUM(CASE WHEN processing_status = 'failed' THEN 1 ELSE 0 END), 0)
                    AS failed
             FROM feedback_embeddings",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.total = overall.try_get("total")?;
        stats.processed = overall.try_get("processed")?;
        stats.failed = overall.try_get("failed")?;

        let clustering = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN cluster_id >= 0 THEN 1 ELSE 0 END), 0) AS clustered,
                COALESCE(SUM(CASE WHEN cluster_id = ? THEN 1 ELSE 0 END), 0) AS noise,
                COUNT(DISTINCT CASE WHEN cluster_id >= 0 THEN cluster_id END) AS num_clusters
             FROM feedback_embeddings
             WHERE embedding IS NOT NULL",
        )
        .bind(CLUSTER_NOISE)
        .fetch_one(&self.pool)
        .await?;
        stats.clustered = clustering.try_get("clustered")?;
        stats.noise = clustering.try_get("noise")?;
        stats.num_clusters = clustering.try_get("num_clusters")?;

        let phase = sqlx::query(
            "SELECT analysis_phase, total_samples, processed_samples, start_time
             FROM analysis_metadata
             ORDER BY id DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = phase {
            stats.phase = Some(PhaseStats {
                phase: row.try_get("analysis_phase")?,
                total: row.try_get("total_samples")?,
                processed: row.try_get("processed_samples")?,
                start_time: row.try_get("start_time")?,
            });
        }

        let batches = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                AVG(processing_time) AS avg_secs
             FROM batch_progress",
        )
        .fetch_one(&self.pool)
        .await?;
        stats.completed_batches = batches.try_get("completed")?;
        stats.failed_batches = batches.try_get("failed")?;
        stats.avg_batch_secs = batches.try_get::<Option<f64>, _>("avg_secs")?.unwrap_or(0.0);

        let cutoff = OffsetDateTime::now_utc() - time::Duration::minutes(5);
        stats.recent_errors = sqlx::query_scalar(
            "SELECT COUNT(*) FROM feedback_embeddings
             WHERE error_message IS NOT NULL AND updated_at > ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        debug!("Monitor stats gathered: {stats:?}");
        Ok(stats)
    }
}

fn cluster_from_row(row: &SqliteRow) -> AppResult<ClusterRow> {
    let samples: String = row.try_get("representative_samples")?;
    let representative_samples: Vec<String> =
        serde_json::from_str(&samples).map_err(AppError::SerdeJson)?;
    Ok(ClusterRow {
        cluster_id: row.try_get("cluster_id")?,
        size: row.try_get("live_size")?,
        description: row.try_get("description")?,
        representative_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(id: i64, text: &str) -> NewSubmission {
        NewSubmission {
            submission_id: id,
            feedback: text.to_string(),
            program_name: "Chicago".to_string(),
            assignment_name: "Board meeting".to_string(),
            created_at: "2025-05-01T12:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn reingesting_the_same_submissions_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let rows = vec![submission(1, "first"), submission(2, "second")];

        store.upsert_submissions(&rows).await.unwrap();
        store.upsert_submissions(&rows).await.unwrap();

        assert_eq!(store.total_rows().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn upsert_updates_text_but_keeps_derived_columns() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_submissions(&[submission(7, "original text")])
            .await
            .unwrap();
        store
            .store_embedded_batch(&[(7, vec![0.1, 0.2])])
            .await
            .unwrap();

        store
            .upsert_submissions(&[submission(7, "edited text")])
            .await
            .unwrap();

        let vectors = store.embedded_vectors().await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].1, vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn candidates_include_failed_rows_but_not_completed_ones() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_submissions(&[
                submission(1, "done"),
                submission(2, "failed last time"),
                submission(3, "never tried"),
            ])
            .await
            .unwrap();
        store.store_embedded_batch(&[(1, vec![1.0])]).await.unwrap();
        store.mark_batch_failed(&[2], 1, "timeout").await.unwrap();

        let candidates = store.embedding_candidates().await.unwrap();
        let ids: Vec<i64> = candidates.iter().map(|c| c.submission_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn failed_rows_carry_zero_vector_sentinel_and_error() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_submissions(&[submission(4, "text")])
            .await
            .unwrap();
        store
            .mark_batch_failed(&[4], 3, "rate limited")
            .await
            .unwrap();

        // The sentinel must not count as a successful embedding.
        assert_eq!(store.embedded_count().await.unwrap(), 0);
        let stats = store.monitor_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.recent_errors, 1);
    }

    #[tokio::test]
    async fn cluster_sizes_are_live_counts() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_submissions(&[
                submission(1, "a"),
                submission(2, "b"),
                submission(3, "c"),
            ])
            .await
            .unwrap();
        store
            .store_embedded_batch(&[(1, vec![1.0]), (2, vec![2.0]), (3, vec![3.0])])
            .await
            .unwrap();
        store
            .apply_assignments(&[(1, 0, 0.0, 0.0), (2, 0, 1.0, 1.0), (3, CLUSTER_NOISE, 2.0, 2.0)])
            .await
            .unwrap();
        // Seed the cluster with a stale size on purpose.
        store
            .replace_clusters(&[(0, 99, vec!["a".to_string()])])
            .await
            .unwrap();

        let clusters = store.clusters_overview().await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].size, 2);

        let (clustered, noise) = store.assignment_counts().await.unwrap();
        assert_eq!(clustered + noise, store.embedded_count().await.unwrap());
    }

    #[tokio::test]
    async fn replace_clusters_regenerates_the_table() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .replace_clusters(&[(0, 5, vec![]), (1, 4, vec![])])
            .await
            .unwrap();
        store.replace_clusters(&[(3, 2, vec![])]).await.unwrap();

        let clusters = store.clusters_overview().await.unwrap();
        let ids: Vec<i64> = clusters.iter().map(|c| c.cluster_id).collect();
        assert_eq!(ids, vec![3]);
    }
}
