//! Delivery event repository

use async_trait::async_trait;
use uuid::Uuid;
use volley_common::types::CampaignId;
use volley_common::{Error, Result};

use crate::db::DatabasePool;
use crate::models::{CreateDeliveryEvent, DeliveryEvent};

/// Append-only delivery event store
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, input: CreateDeliveryEvent) -> Result<DeliveryEvent>;
    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<DeliveryEvent>>;
}

/// Database delivery event repository
#[derive(Clone)]
pub struct DbEventRepository {
    pool: DatabasePool,
}

impl DbEventRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for DbEventRepository {
    async fn append(&self, input: CreateDeliveryEvent) -> Result<DeliveryEvent> {
        sqlx::query_as::<_, DeliveryEvent>(
            r#"
            INSERT INTO delivery_events (id, campaign_id, recipient_id, email, event_type, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.campaign_id)
        .bind(input.recipient_id)
        .bind(&input.email)
        .bind(input.event_type.to_string())
        .bind(input.detail.unwrap_or_else(|| serde_json::json!({})))
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<DeliveryEvent>> {
        sqlx::query_as::<_, DeliveryEvent>(
            "SELECT * FROM delivery_events WHERE campaign_id = $1 ORDER BY created_at ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
