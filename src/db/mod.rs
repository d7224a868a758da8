//! Database module

mod schema;
mod write_buffer;

pub use write_buffer::{start_write_buffer, DbSink};

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{Pool, Sqlite, SqlitePool};

use crate::config::DatabaseConfig;
use crate::events::{Event, EventKind};

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every connection would otherwise see its own
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TIMESTAMP)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_PORT)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_SOURCE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a batch of events in one transaction
    pub async fn batch_insert_events(&self, events: &[Event]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            let fields = serde_json::to_string(&event.fields)?;
            sqlx::query(
                r#"
                INSERT INTO events (timestamp, kind, message, port, source, classification, fields)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.timestamp.timestamp_millis())
            .bind(event.kind.as_str())
            .bind(&event.message)
            .bind(event.port().map(i32::from))
            .bind(event.source())
            .bind(event.classification())
            .bind(fields)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn count_events(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Most recent events, newest first
    pub async fn recent_events(&self, limit: i32) -> Result<Vec<Event>> {
        let rows: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT timestamp, kind, message, fields
            FROM events
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ts, kind, message, fields)| Event {
                timestamp: chrono::DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now),
                kind: parse_kind(&kind),
                message,
                fields: fields
                    .and_then(|f| serde_json::from_str::<Map<String, Value>>(&f).ok())
                    .unwrap_or_default(),
            })
            .collect())
    }
}

fn parse_kind(kind: &str) -> EventKind {
    match kind {
        "connection" => EventKind::Connection,
        "stopped" => EventKind::Stopped,
        "error" => EventKind::Error,
        _ => EventKind::Info,
    }
}
