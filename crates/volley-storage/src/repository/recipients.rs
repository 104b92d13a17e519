//! Recipient repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use volley_common::types::{CampaignId, RecipientId};
use volley_common::{Error, Result};

use crate::db::DatabasePool;
use crate::models::{CampaignCounters, CreateRecipient, Recipient};

/// Recipient store trait
#[async_trait]
pub trait RecipientStore: Send + Sync {
    async fn create_batch(
        &self,
        campaign_id: CampaignId,
        inputs: &[CreateRecipient],
    ) -> Result<Vec<Recipient>>;
    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>>;
    async fn find_by_email(
        &self,
        campaign_id: CampaignId,
        email: &str,
    ) -> Result<Option<Recipient>>;
    /// Pending recipients whose retry time (if any) has passed, oldest first
    async fn list_due_pending(
        &self,
        campaign_id: CampaignId,
        limit: i64,
    ) -> Result<Vec<Recipient>>;
    /// Claim a pending recipient for sending; returns false when another
    /// worker already took it
    async fn claim(&self, id: RecipientId) -> Result<bool>;
    /// Return recipients a dead process left in `sending` to `pending`;
    /// returns how many were released
    async fn release_stale_sending(&self, campaign_id: CampaignId) -> Result<u64>;
    async fn mark_sent(&self, id: RecipientId) -> Result<()>;
    async fn mark_failed(&self, id: RecipientId, error: &str) -> Result<()>;
    async fn mark_bounced(&self, id: RecipientId, error: &str) -> Result<()>;
    async fn mark_unsubscribed(&self, id: RecipientId) -> Result<()>;
    /// Return a claimed recipient to `pending` with a retry deadline
    async fn schedule_retry(
        &self,
        id: RecipientId,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;
    /// Record the first open; returns true only on the first occurrence
    async fn record_open(&self, id: RecipientId) -> Result<bool>;
    /// Record the first click; returns true only on the first occurrence
    async fn record_click(&self, id: RecipientId) -> Result<bool>;
    /// Recompute state aggregates from recipient rows
    async fn counters(&self, campaign_id: CampaignId) -> Result<CampaignCounters>;
    async fn count_by_campaign(&self, campaign_id: CampaignId) -> Result<i64>;
}

/// Database recipient repository
#[derive(Clone)]
pub struct DbRecipientRepository {
    pool: DatabasePool,
}

impl DbRecipientRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientStore for DbRecipientRepository {
    async fn create_batch(
        &self,
        campaign_id: CampaignId,
        inputs: &[CreateRecipient],
    ) -> Result<Vec<Recipient>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut created = Vec::with_capacity(inputs.len());
        for input in inputs {
            let recipient = sqlx::query_as::<_, Recipient>(
                r#"
                INSERT INTO recipients (
                    id, campaign_id, email, first_name, last_name, company, attributes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (campaign_id, email) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(campaign_id)
            .bind(input.email.to_lowercase())
            .bind(&input.first_name)
            .bind(&input.last_name)
            .bind(&input.company)
            .bind(
                input
                    .attributes
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            if let Some(recipient) = recipient {
                created.push(recipient);
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(created)
    }

    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_by_email(
        &self,
        campaign_id: CampaignId,
        email: &str,
    ) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, Recipient>(
            "SELECT * FROM recipients WHERE campaign_id = $1 AND email = $2",
        )
        .bind(campaign_id)
        .bind(email.to_lowercase())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_due_pending(
        &self,
        campaign_id: CampaignId,
        limit: i64,
    ) -> Result<Vec<Recipient>> {
        sqlx::query_as::<_, Recipient>(
            r#"
            SELECT * FROM recipients
            WHERE campaign_id = $1
              AND status = 'pending'
              AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn claim(&self, id: RecipientId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET status = 'sending', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_stale_sending(&self, campaign_id: CampaignId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET status = 'pending', updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'sending'
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn mark_sent(&self, id: RecipientId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'sent',
                sent_at = NOW(),
                error_message = NULL,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_failed(&self, id: RecipientId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'failed',
                error_message = $2,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_bounced(&self, id: RecipientId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'bounced',
                error_message = $2,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_unsubscribed(&self, id: RecipientId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'unsubscribed',
                unsubscribed_at = COALESCE(unsubscribed_at, NOW()),
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: RecipientId,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE recipients SET
                status = 'pending',
                retry_count = $2,
                next_attempt_at = $3,
                error_message = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_attempt_at)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_open(&self, id: RecipientId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET opened_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND opened_at IS NULL
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_click(&self, id: RecipientId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recipients SET clicked_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND clicked_at IS NULL
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn counters(&self, campaign_id: CampaignId) -> Result<CampaignCounters> {
        sqlx::query_as::<_, CampaignCounters>(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'sending') AS sending,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'bounced') AS bounced,
                COUNT(*) FILTER (WHERE status = 'unsubscribed') AS unsubscribed,
                COUNT(opened_at) AS opened,
                COUNT(clicked_at) AS clicked
            FROM recipients
            WHERE campaign_id = $1
            "#,
        )
        .bind(campaign_id)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn count_by_campaign(&self, campaign_id: CampaignId) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM recipients WHERE campaign_id = $1")
                .bind(campaign_id)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count.0)
    }
}
