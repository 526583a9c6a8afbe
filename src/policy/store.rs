//! Durable approval-request store.
//!
//! Requests and their plan snapshots survive process restarts so approval
//! can be granted out-of-band and execution resumed by request id.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::{ApprovalRequest, ApprovalStatus, RiskLevel};

pub struct ApprovalStore {
    pool: SqlitePool,
}

impl ApprovalStore {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS approval_requests (
                id TEXT PRIMARY KEY,
                intent TEXT NOT NULL,
                risk TEXT NOT NULL,
                plan_summary TEXT NOT NULL,
                plan_snapshot TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_approval_status ON approval_requests(status)",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn insert(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO approval_requests
             (id, intent, risk, plan_summary, plan_snapshot, status, created_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(&request.intent)
        .bind(request.risk.as_str())
        .bind(&request.plan_summary)
        .bind(request.plan_snapshot.to_string())
        .bind(request.status.as_str())
        .bind(request.created_at.to_rfc3339())
        .bind(request.resolved_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> anyhow::Result<Option<ApprovalRequest>> {
        let row = sqlx::query(
            "SELECT id, intent, risk, plan_summary, plan_snapshot, status, created_at, resolved_at
             FROM approval_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_request).transpose()?)
    }

    /// Mark a pending request approved or rejected. Terminal — a resolved
    /// request never changes again.
    pub async fn resolve(&self, id: &str, approved: bool) -> anyhow::Result<()> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let updated = sqlx::query(
            "UPDATE approval_requests SET status = ?, resolved_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            anyhow::bail!("approval request {id} is not pending");
        }
        Ok(())
    }

    pub async fn list_pending(&self) -> anyhow::Result<Vec<ApprovalRequest>> {
        let rows = sqlx::query(
            "SELECT id, intent, risk, plan_summary, plan_snapshot, status, created_at, resolved_at
             FROM approval_requests WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_request).collect()
    }
}

fn row_to_request(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<ApprovalRequest> {
    let risk: String = row.get("risk");
    let status: String = row.get("status");
    let snapshot: String = row.get("plan_snapshot");
    let created_at: String = row.get("created_at");
    let resolved_at: Option<String> = row.get("resolved_at");
    Ok(ApprovalRequest {
        id: row.get("id"),
        intent: row.get("intent"),
        risk: RiskLevel::from_str(&risk)
            .ok_or_else(|| anyhow::anyhow!("unknown risk level in store: {risk}"))?,
        plan_summary: row.get("plan_summary"),
        plan_snapshot: serde_json::from_str(&snapshot)?,
        status: ApprovalStatus::from_str(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown approval status in store: {status}"))?,
        created_at: created_at.parse::<DateTime<Utc>>()?,
        resolved_at: resolved_at.map(|t| t.parse::<DateTime<Utc>>()).transpose()?,
    })
}
