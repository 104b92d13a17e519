//! Suppression list repository

use async_trait::async_trait;
use uuid::Uuid;
use volley_common::types::CampaignId;
use volley_common::{Error, Result};

use crate::db::DatabasePool;
use crate::models::{CreateSuppression, Suppression};

/// Suppression list store
#[async_trait]
pub trait SuppressionStore: Send + Sync {
    async fn upsert(&self, input: CreateSuppression) -> Result<Suppression>;
    /// A recipient is suppressed when a global entry or an entry scoped
    /// to the given campaign exists and has not expired
    async fn is_suppressed(&self, email: &str, campaign_id: CampaignId) -> Result<bool>;
}

/// Database suppression repository
#[derive(Clone)]
pub struct DbSuppressionRepository {
    pool: DatabasePool,
}

impl DbSuppressionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SuppressionStore for DbSuppressionRepository {
    async fn upsert(&self, input: CreateSuppression) -> Result<Suppression> {
        sqlx::query_as::<_, Suppression>(
            r#"
            INSERT INTO suppressions (id, email, reason, campaign_id, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email, campaign_id) DO UPDATE
                SET reason = EXCLUDED.reason,
                    expires_at = EXCLUDED.expires_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.email.to_lowercase())
        .bind(&input.reason)
        .bind(input.campaign_id)
        .bind(input.expires_at)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn is_suppressed(&self, email: &str, campaign_id: CampaignId) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM suppressions
            WHERE email = $1
              AND (campaign_id IS NULL OR campaign_id = $2)
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(email.to_lowercase())
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count.0 > 0)
    }
}
