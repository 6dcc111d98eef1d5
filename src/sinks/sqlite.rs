//! SQLite-backed durable sink.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{normalize_query, DurableSink};
use crate::error::SinkError;
use crate::task::MemoryItem;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS memory_items (
    id          TEXT NOT NULL PRIMARY KEY,
    pool_id     TEXT NOT NULL,
    task_id     TEXT,
    worker_id   TEXT,
    content     TEXT NOT NULL,
    -- lower-cased searchable text
    search_text TEXT NOT NULL,
    tags        TEXT NOT NULL DEFAULT '[]',
    recorded_at TEXT NOT NULL,
    stored_at   TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_memory_items_pool ON memory_items(pool_id);
CREATE INDEX IF NOT EXISTS idx_memory_items_recorded ON memory_items(recorded_at);
"#;

#[derive(Clone)]
pub struct SqliteDurableSink {
    pool: SqlitePool,
}

impl SqliteDurableSink {
    /// Opens (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    /// Connects to a `sqlite:` URL.
    pub async fn connect(url: &str) -> Result<Self, SinkError> {
        let in_memory = url.contains(":memory:");
        let mut opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal);
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        // every in-memory connection is its own database
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(url = url, "Memory item store opened");
        Ok(Self { pool })
    }

    pub async fn count(&self) -> Result<u64, SinkError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM memory_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Escapes LIKE wildcards so the query matches literally.
fn like_pattern(query: &str) -> String {
    let escaped = normalize_query(query)
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryItem, SinkError> {
    let parse_uuid = |value: String| {
        Uuid::parse_str(&value).map_err(|e| SinkError::Unavailable(format!("corrupt id '{}': {}", value, e)))
    };

    let task_id = row
        .try_get::<Option<String>, _>("task_id")?
        .map(parse_uuid)
        .transpose()?;

    Ok(MemoryItem {
        id: parse_uuid(row.try_get("id")?)?,
        pool_id: row.try_get("pool_id")?,
        task_id,
        worker_id: row.try_get("worker_id")?,
        content: serde_json::from_str(&row.try_get::<String, _>("content")?)?,
        tags: serde_json::from_str(&row.try_get::<String, _>("tags")?)?,
        recorded_at: row.try_get::<DateTime<Utc>, _>("recorded_at")?,
    })
}

#[async_trait]
impl DurableSink for SqliteDurableSink {
    async fn store(&self, items: &[MemoryItem]) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                "INSERT INTO memory_items (
                    id, pool_id, task_id, worker_id, content, search_text, tags, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    content = excluded.content,
                    search_text = excluded.search_text,
                    tags = excluded.tags,
                    stored_at = datetime('now')",
            )
            .bind(item.id.to_string())
            .bind(&item.pool_id)
            .bind(item.task_id.map(|id| id.to_string()))
            .bind(&item.worker_id)
            .bind(serde_json::to_string(&item.content)?)
            .bind(item.searchable_text().to_lowercase())
            .bind(serde_json::to_string(&item.tags)?)
            .bind(item.recorded_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryItem>, SinkError> {
        let rows = sqlx::query(
            "SELECT id, pool_id, task_id, worker_id, content, tags, recorded_at
             FROM memory_items
             WHERE search_text LIKE ?1 ESCAPE '\\'
             ORDER BY recorded_at DESC
             LIMIT ?2",
        )
        .bind(like_pattern(query))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn item(content: serde_json::Value, minutes_ago: i64) -> MemoryItem {
        MemoryItem {
            id: Uuid::new_v4(),
            pool_id: "gpu".to_string(),
            task_id: Some(Uuid::new_v4()),
            worker_id: Some("gpu-w1".to_string()),
            content,
            tags: vec!["gpu".to_string()],
            recorded_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" 100%  Done_ "), "%100\\% done\\_%");
    }

    #[tokio::test]
    async fn test_store_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteDurableSink::open(&dir.path().join("items.db"))
            .await
            .unwrap();

        let old = item(json!({"stdout": "Training finished"}), 5);
        let new = item(json!("training FINISHED again"), 1);
        sink.store(&[old.clone(), new.clone(), item(json!("idle"), 0)])
            .await
            .unwrap();
        assert_eq!(sink.count().await.unwrap(), 3);

        let found = sink.search("training finished", 10).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, new.id);
        assert_eq!(found[1].id, old.id);
        assert_eq!(found[1].content, old.content);
        assert_eq!(found[1].tags, old.tags);

        assert_eq!(sink.search("training", 1).await.unwrap().len(), 1);
        assert!(sink.search("100%", 10).await.unwrap().is_empty());

        // re-storing an item is an upsert
        sink.store(&[old]).await.unwrap();
        assert_eq!(sink.count().await.unwrap(), 3);
        sink.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_url() {
        let sink = SqliteDurableSink::connect("sqlite::memory:").await.unwrap();
        sink.store(&[item(json!("hello"), 0)]).await.unwrap();
        assert_eq!(sink.search("HELLO", 5).await.unwrap().len(), 1);
    }
}
