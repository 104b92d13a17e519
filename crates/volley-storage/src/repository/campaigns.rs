//! Campaign repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use volley_common::types::CampaignId;
use volley_common::{Error, Result};

use crate::db::DatabasePool;
use crate::models::{Campaign, CampaignCounters, CampaignStatus, CreateCampaign};

/// Campaign store trait
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign>;
    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>>;
    /// Campaigns in `scheduled` whose scheduled time has passed
    async fn list_scheduled_due(&self) -> Result<Vec<Campaign>>;
    async fn list_in_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
    /// Guarded status transition; returns false if the campaign was not
    /// in one of the expected states (first writer wins)
    async fn transition(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool>;
    /// Set the schedule and move to `scheduled`, guarded by `from`
    async fn set_schedule(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
        from: &[CampaignStatus],
    ) -> Result<bool>;
    async fn set_total_recipients(&self, id: CampaignId, total: i64) -> Result<()>;
    /// Persist counters recomputed from recipient state
    async fn update_counters(&self, id: CampaignId, counters: &CampaignCounters) -> Result<()>;
}

/// Database campaign repository
#[derive(Clone)]
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn status_strings(statuses: &[CampaignStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl CampaignStore for DbCampaignRepository {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let id = Uuid::new_v4();

        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, name, subject, html_body, text_body, from_address, from_name,
                reply_to, scheduled_at, batch_size, rate_limit_per_second,
                max_retry_attempts, webhook_enabled, webhook_url, webhook_secret
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.subject)
        .bind(&input.html_body)
        .bind(&input.text_body)
        .bind(&input.from_address)
        .bind(&input.from_name)
        .bind(&input.reply_to)
        .bind(input.scheduled_at)
        .bind(input.batch_size.unwrap_or(100))
        .bind(input.rate_limit_per_second.unwrap_or(10))
        .bind(input.max_retry_attempts.unwrap_or(3))
        .bind(input.webhook_enabled.unwrap_or(false))
        .bind(&input.webhook_url)
        .bind(&input.webhook_secret)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_scheduled_due(&self) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status = 'scheduled'
              AND scheduled_at IS NOT NULL
              AND scheduled_at <= NOW()
            ORDER BY scheduled_at ASC
            "#,
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_in_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn transition(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = $2,
                started_at = CASE
                    WHEN $2 = 'sending' AND started_at IS NULL THEN NOW()
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN $2 IN ('completed', 'failed', 'cancelled') THEN NOW()
                    ELSE completed_at
                END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(to.to_string())
        .bind(status_strings(from))
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_schedule(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
        from: &[CampaignStatus],
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns SET
                status = 'scheduled',
                scheduled_at = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(status_strings(from))
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i64) -> Result<()> {
        sqlx::query(
            "UPDATE campaigns SET total_recipients = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(total as i32)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn update_counters(&self, id: CampaignId, counters: &CampaignCounters) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                total_recipients = $2,
                sent_count = $3,
                failed_count = $4,
                opened_count = $5,
                clicked_count = $6,
                unsubscribed_count = $7,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(counters.total as i32)
        .bind(counters.sent as i32)
        .bind(counters.failed_total() as i32)
        .bind(counters.opened as i32)
        .bind(counters.clicked as i32)
        .bind(counters.unsubscribed as i32)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}
