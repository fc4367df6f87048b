//! Usage gate
//!
//! Meters content generation against the workspace quota. The
//! check-then-increment is a classic race under concurrent requests, so
//! [`UsageMeter::record_success`] performs the compare and the increment
//! as a single conditional UPDATE; two concurrent callers can never push
//! `usage_count` past `usage_limit`.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Quota comparison shared by the advisory check and the atomic increment
pub fn has_remaining(usage_count: i64, usage_limit: i64) -> bool {
    usage_count < usage_limit
}

pub struct UsageMeter {
    pool: PgPool,
}

impl UsageMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Advisory pre-check before starting a generation attempt
    ///
    /// Cancellation does not block consumption here: a canceled
    /// subscription keeps its plan quota until the period boundary, and
    /// whether callers should additionally gate on status is their call.
    pub async fn can_consume(&self, workspace_id: Uuid) -> BillingResult<bool> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT usage_count, usage_limit FROM workspaces WHERE id = $1")
                .bind(workspace_id)
                .fetch_optional(&self.pool)
                .await?;

        let (count, limit) = row.ok_or(BillingError::WorkspaceNotFound(workspace_id))?;
        Ok(has_remaining(count, limit))
    }

    /// Advance the usage counter for one successful generation
    ///
    /// Compare-and-increment in a single statement; returns false when the
    /// quota was exhausted between the advisory check and here, in which
    /// case the counter is untouched. Failed generations must not call
    /// this at all.
    pub async fn record_success(&self, workspace_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET usage_count = usage_count + 1, updated_at = NOW()
            WHERE id = $1 AND usage_count < usage_limit
            "#,
        )
        .bind(workspace_id)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            tracing::warn!(
                workspace_id = %workspace_id,
                "Usage increment rejected: quota exhausted or workspace missing"
            );
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_quota_comparison() {
        assert!(has_remaining(0, 100));
        assert!(has_remaining(99, 100));
        assert!(!has_remaining(100, 100));
        assert!(!has_remaining(101, 100));
    }

    #[test]
    fn zero_limit_blocks_everything() {
        assert!(!has_remaining(0, 0));
    }
}
