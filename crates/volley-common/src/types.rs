//! Common types for Volley

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for recipients
pub type RecipientId = Uuid;

/// Unique identifier for delivery events
pub type EventId = Uuid;

/// Unique identifier for suppression entries
pub type SuppressionId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;
