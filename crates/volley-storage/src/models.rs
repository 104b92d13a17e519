//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use volley_common::types::{CampaignId, EventId, RecipientId, SuppressionId};

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = volley_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(volley_common::Error::Validation(format!(
                "Unknown campaign status: {}",
                other
            ))),
        }
    }
}

/// Per-recipient delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Bounced,
    Unsubscribed,
}

impl RecipientStatus {
    /// Terminal recipients must never be re-selected by the dispatcher
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecipientStatus::Sent
                | RecipientStatus::Failed
                | RecipientStatus::Bounced
                | RecipientStatus::Unsubscribed
        )
    }
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sending => "sending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
            RecipientStatus::Bounced => "bounced",
            RecipientStatus::Unsubscribed => "unsubscribed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RecipientStatus {
    type Err = volley_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "sending" => Ok(RecipientStatus::Sending),
            "sent" => Ok(RecipientStatus::Sent),
            "failed" => Ok(RecipientStatus::Failed),
            "bounced" => Ok(RecipientStatus::Bounced),
            "unsubscribed" => Ok(RecipientStatus::Unsubscribed),
            other => Err(volley_common::Error::Validation(format!(
                "Unknown recipient status: {}",
                other
            ))),
        }
    }
}

/// Delivery event types (append-only audit log)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Sent,
    Failed,
    Opened,
    Clicked,
    Bounced,
    Unsubscribed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Sent => "sent",
            EventType::Failed => "failed",
            EventType::Opened => "opened",
            EventType::Clicked => "clicked",
            EventType::Bounced => "bounced",
            EventType::Unsubscribed => "unsubscribed",
        };
        write!(f, "{}", s)
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub batch_size: i32,
    pub rate_limit_per_second: i32,
    pub max_retry_attempts: i32,
    pub webhook_enabled: bool,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub opened_count: i32,
    pub clicked_count: i32,
    pub unsubscribed_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Parse the stored status
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// From header value, with optional display name
    pub fn from_mailbox(&self) -> String {
        match &self.from_name {
            Some(name) => format!("{} <{}>", name, self.from_address),
            None => self.from_address.clone(),
        }
    }

}

/// Recipient model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub attributes: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    /// Parse the stored status
    pub fn status_enum(&self) -> Option<RecipientStatus> {
        self.status.parse().ok()
    }
}

/// Immutable delivery event log entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub id: EventId,
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub email: String,
    pub event_type: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Suppression list entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Suppression {
    pub id: SuppressionId,
    pub email: String,
    pub reason: String,
    pub campaign_id: Option<CampaignId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub batch_size: Option<i32>,
    pub rate_limit_per_second: Option<i32>,
    pub max_retry_attempts: Option<i32>,
    pub webhook_enabled: Option<bool>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

/// Create recipient input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecipient {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

/// Create delivery event input
#[derive(Debug, Clone)]
pub struct CreateDeliveryEvent {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub email: String,
    pub event_type: EventType,
    pub detail: Option<serde_json::Value>,
}

/// Create suppression input
#[derive(Debug, Clone)]
pub struct CreateSuppression {
    pub email: String,
    pub reason: String,
    pub campaign_id: Option<CampaignId>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Recipient state aggregates for one campaign, recomputed from the
/// recipients table rather than incremented in place
#[derive(Debug, Clone, Copy, Default, FromRow, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total: i64,
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub bounced: i64,
    pub unsubscribed: i64,
    pub opened: i64,
    pub clicked: i64,
}

impl CampaignCounters {
    /// True when no recipient can still make progress
    pub fn is_finished(&self) -> bool {
        self.pending == 0 && self.sending == 0
    }

    /// Failed and bounced both count as failures on the campaign
    pub fn failed_total(&self) -> i64 {
        self.failed + self.bounced
    }
}
