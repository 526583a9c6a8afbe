//! Durable sqlite sink for the trace event stream.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::{EventType, TraceEvent};

pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trace_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL,
                step_sequence INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trace_events_trace ON trace_events(trace_id)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn insert(&self, event: &TraceEvent) -> anyhow::Result<i64> {
        let event_type = serde_json::to_value(event.event_type)?
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let result = sqlx::query(
            "INSERT INTO trace_events (trace_id, step_sequence, event_type, data, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.trace_id)
        .bind(event.step_sequence)
        .bind(&event_type)
        .bind(event.data.to_string())
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Full trace in sequence order — the replay channel.
    pub async fn list_for_trace(&self, trace_id: &str) -> anyhow::Result<Vec<TraceEvent>> {
        let rows = sqlx::query(
            "SELECT id, trace_id, step_sequence, event_type, data, created_at
             FROM trace_events WHERE trace_id = ? ORDER BY step_sequence ASC",
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_type: String = row.get("event_type");
            let Ok(event_type) =
                serde_json::from_value::<EventType>(serde_json::Value::String(event_type))
            else {
                continue; // unknown type written by a newer version
            };
            let data: String = row.get("data");
            let created_at: String = row.get("created_at");
            events.push(TraceEvent {
                id: row.get("id"),
                trace_id: row.get("trace_id"),
                step_sequence: row.get("step_sequence"),
                event_type,
                data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(events)
    }
}
