//! Durable Buffer (C2): an append-only, per-increment durable log with a
//! sync flag. Backed by SQLite with a single writer per process (spec §4.1).
//!
//! Grounded on `incidents.rs`'s `IncidentStore`: same `SqlitePool` +
//! `CREATE TABLE IF NOT EXISTS` constructor, same manual `.bind()` /
//! `.fetch_*` query style rather than sqlx's compile-time-checked macros.

use crate::error::StorageError;
use crate::model::{Increment, IncrementSource, Station};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions};
use std::path::Path;
use tracing::{debug, info};

pub struct DurableBuffer {
    pool: SqlitePool,
}

impl DurableBuffer {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS increments (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                order_code TEXT NOT NULL,
                upc TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                occurred_at TEXT NOT NULL,
                source TEXT NOT NULL,
                station_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                order_id INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                rejected INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_increments_synced_seq ON increments(synced, seq);
            CREATE INDEX IF NOT EXISTS idx_increments_order_station ON increments(order_code, station_id);
            CREATE TABLE IF NOT EXISTS stations (
                station_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                selected_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        info!(
            "durable buffer initialized at {}",
            db_path.as_ref().display()
        );
        Ok(Self { pool })
    }

    /// Assigns `seq`, persists the row with `synced=false`, returns `seq`.
    /// The returned `seq` is durable: sqlx awaits the write before this
    /// function returns, so a crash after return cannot lose the record.
    pub async fn append(&self, increment: &Increment) -> Result<i64, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO increments (
                order_code, upc, quantity, occurred_at, source,
                station_id, user_id, order_id, fingerprint, synced, rejected
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0)
            "#,
        )
        .bind(&increment.order_code)
        .bind(&increment.upc)
        .bind(increment.quantity)
        .bind(increment.occurred_at.to_rfc3339())
        .bind(increment.source.as_str())
        .bind(increment.station_id as i64)
        .bind(increment.user_id as i64)
        .bind(increment.order_id as i64)
        .bind(&increment.fingerprint)
        .execute(&self.pool)
        .await?;

        let seq = result.last_insert_rowid();
        debug!("appended increment #{} for order {}", seq, increment.order_code);
        Ok(seq)
    }

    /// Returns the oldest `limit` unsynced, non-rejected rows in `seq` order.
    pub async fn pending_batch(&self, limit: usize) -> Result<Vec<Increment>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, order_code, upc, quantity, occurred_at, source,
                   station_id, user_id, order_id, fingerprint, synced, rejected
            FROM increments
            WHERE synced = 0 AND rejected = 0
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_increment).collect()
    }

    /// Atomic flip to `synced=true` for the given seqs. Idempotent.
    pub async fn mark_synced(&self, seqs: &[i64]) -> Result<(), StorageError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for seq in seqs {
            sqlx::query("UPDATE increments SET synced = 1 WHERE seq = ?")
                .bind(seq)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!("marked {} increment(s) synced", seqs.len());
        Ok(())
    }

    /// Flips a single row to `synced=true, rejected=true` — the poison path
    /// used on a `Permanent` upload failure (§4.5). Idempotent.
    pub async fn mark_rejected(&self, seq: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE increments SET synced = 1, rejected = 1 WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        debug!("rejected increment #{}", seq);
        Ok(())
    }

    /// Exact count of rows with `synced=false AND rejected=false`.
    pub async fn pending_count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) FROM increments WHERE synced = 0 AND rejected = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    /// Deletes `synced=true` rows older than `retention`. Intended to run
    /// from a dedicated housekeeping task, never on the Append/Replicator
    /// hot path.
    pub async fn vacuum(&self, retention: chrono::Duration) -> Result<u64, StorageError> {
        let cutoff = (Utc::now() - retention).to_rfc3339();
        let result = sqlx::query(
            "DELETE FROM increments WHERE synced = 1 AND rejected = 0 AND occurred_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            info!("vacuumed {} synced increment(s)", deleted);
        }
        Ok(deleted)
    }

    pub async fn save_station(&self, station: &Station) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO stations (station_id, name, selected_at)
            VALUES (?, ?, ?)
            ON CONFLICT(station_id) DO UPDATE SET name = excluded.name, selected_at = excluded.selected_at
            "#,
        )
        .bind(station.id as i64)
        .bind(&station.name)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_station(&self) -> Result<Option<Station>, StorageError> {
        let row = sqlx::query(
            "SELECT station_id, name FROM stations ORDER BY selected_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Station {
            id: r.get::<i64, _>(0) as u64,
            name: r.get(1),
            description: None,
        }))
    }
}

fn row_to_increment(r: sqlx::sqlite::SqliteRow) -> Result<Increment, StorageError> {
    let occurred_at: String = r.get(4);
    let occurred_at = DateTime::parse_from_rfc3339(&occurred_at)
        .map_err(|_| StorageError::Corrupt)?
        .with_timezone(&Utc);
    let source: String = r.get(5);

    Ok(Increment {
        seq: r.get(0),
        order_code: r.get(1),
        upc: r.get(2),
        quantity: r.get(3),
        occurred_at,
        source: IncrementSource::from_str(&source),
        station_id: r.get::<i64, _>(6) as u64,
        user_id: r.get::<i64, _>(7) as u64,
        order_id: r.get::<i64, _>(8) as u64,
        fingerprint: r.get(9),
        synced: r.get::<i64, _>(10) != 0,
        rejected: r.get::<i64, _>(11) != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_increment(order_code: &str, quantity: i64) -> Increment {
        Increment {
            seq: 0,
            order_code: order_code.to_string(),
            upc: "012345678905".to_string(),
            quantity,
            occurred_at: Utc::now(),
            source: IncrementSource::Device,
            station_id: 7,
            user_id: 1,
            order_id: 100,
            synced: false,
            rejected: false,
            fingerprint: "deadbeefcafef00d".to_string(),
        }
    }

    async fn new_buffer() -> (DurableBuffer, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let buffer = DurableBuffer::new(file.path()).await.unwrap();
        (buffer, file)
    }

    #[tokio::test]
    async fn append_then_pending_batch_round_trip() {
        let (buffer, _file) = new_buffer().await;
        let seq = buffer.append(&sample_increment("OF-100", 1)).await.unwrap();
        assert_eq!(buffer.pending_count().await.unwrap(), 1);

        let batch = buffer.pending_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, seq);
        assert!(!batch[0].synced);
    }

    #[tokio::test]
    async fn mark_synced_drops_row_from_pending_count() {
        let (buffer, _file) = new_buffer().await;
        let seq = buffer.append(&sample_increment("OF-100", 1)).await.unwrap();
        buffer.mark_synced(&[seq]).await.unwrap();
        assert_eq!(buffer.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let (buffer, _file) = new_buffer().await;
        let seq = buffer.append(&sample_increment("OF-100", 1)).await.unwrap();
        buffer.mark_synced(&[seq]).await.unwrap();
        buffer.mark_synced(&[seq]).await.unwrap();
        assert_eq!(buffer.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_batch_returns_strictly_increasing_seq_order() {
        let (buffer, _file) = new_buffer().await;
        for i in 1..=5 {
            buffer.append(&sample_increment("OF-100", i)).await.unwrap();
        }
        let batch = buffer.pending_batch(10).await.unwrap();
        let seqs: Vec<i64> = batch.iter().map(|i| i.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
        assert_eq!(seqs.len(), 5);
    }

    #[tokio::test]
    async fn mark_rejected_excludes_row_from_pending_batch_and_count() {
        let (buffer, _file) = new_buffer().await;
        let seq = buffer.append(&sample_increment("OF-100", 1)).await.unwrap();
        buffer.mark_rejected(seq).await.unwrap();
        assert_eq!(buffer.pending_count().await.unwrap(), 0);
        assert!(buffer.pending_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn station_round_trips() {
        let (buffer, _file) = new_buffer().await;
        let station = Station {
            id: 7,
            name: "Line 1".to_string(),
            description: None,
        };
        buffer.save_station(&station).await.unwrap();
        let loaded = buffer.load_station().await.unwrap().unwrap();
        assert_eq!(loaded.id, 7);
        assert_eq!(loaded.name, "Line 1");
    }

    #[tokio::test]
    async fn vacuum_only_removes_old_synced_rows() {
        let (buffer, _file) = new_buffer().await;
        let seq = buffer.append(&sample_increment("OF-100", 1)).await.unwrap();
        buffer.mark_synced(&[seq]).await.unwrap();
        let deleted = buffer.vacuum(chrono::Duration::days(30)).await.unwrap();
        assert_eq!(deleted, 0);
        let deleted = buffer.vacuum(chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(deleted, 1);
    }
}
