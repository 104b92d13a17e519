//! In-memory stores and a scriptable transport for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;
use volley_common::types::{CampaignId, RecipientId};
use volley_common::Result;
use volley_storage::models::{
    Campaign, CampaignCounters, CampaignStatus, CreateCampaign, CreateDeliveryEvent,
    CreateRecipient, CreateSuppression, DeliveryEvent, EventType, Recipient, RecipientStatus,
    Suppression,
};
use volley_storage::repository::{CampaignStore, EventStore, RecipientStore, SuppressionStore};

use crate::transport::{OutboundEmail, Transport, TransportError};

/// Backing state shared by all four in-memory stores
#[derive(Default)]
pub struct MemoryStores {
    campaigns: Mutex<HashMap<CampaignId, Campaign>>,
    recipients: Mutex<HashMap<RecipientId, Recipient>>,
    events: Mutex<Vec<DeliveryEvent>>,
    suppressions: Mutex<Vec<Suppression>>,
    /// When set, retry deadlines are treated as already due so retry
    /// flows can be exercised without waiting out the backoff
    pub retries_immediately_due: AtomicBool,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.lock().unwrap().insert(campaign.id, campaign);
    }

    pub fn insert_recipient(&self, recipient: Recipient) {
        self.recipients
            .lock()
            .unwrap()
            .insert(recipient.id, recipient);
    }

    pub fn recipient(&self, id: RecipientId) -> Option<Recipient> {
        self.recipients.lock().unwrap().get(&id).cloned()
    }

    pub fn campaign(&self, id: CampaignId) -> Option<Campaign> {
        self.campaigns.lock().unwrap().get(&id).cloned()
    }

    pub fn events_of_type(&self, campaign_id: CampaignId, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.campaign_id == campaign_id && e.event_type == event_type.to_string())
            .count()
    }
}

#[async_trait]
impl CampaignStore for MemoryStores {
    async fn create(&self, input: CreateCampaign) -> Result<Campaign> {
        let campaign = campaign_from_input(input);
        self.insert_campaign(campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.campaign(id))
    }

    async fn list_scheduled_due(&self) -> Result<Vec<Campaign>> {
        let now = Utc::now();
        Ok(self
            .campaigns
            .lock()
            .unwrap()
            .values()
            .filter(|c| {
                c.status == "scheduled" && c.scheduled_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn list_in_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        Ok(self
            .campaigns
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.status == status.to_string())
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        let mut campaigns = self.campaigns.lock().unwrap();
        let Some(campaign) = campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if !from.iter().any(|s| campaign.status == s.to_string()) {
            return Ok(false);
        }
        campaign.status = to.to_string();
        match to {
            CampaignStatus::Sending => {
                campaign.started_at.get_or_insert_with(Utc::now);
            }
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled => {
                campaign.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_schedule(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
        from: &[CampaignStatus],
    ) -> Result<bool> {
        let mut campaigns = self.campaigns.lock().unwrap();
        let Some(campaign) = campaigns.get_mut(&id) else {
            return Ok(false);
        };
        if !from.iter().any(|s| campaign.status == s.to_string()) {
            return Ok(false);
        }
        campaign.status = CampaignStatus::Scheduled.to_string();
        campaign.scheduled_at = Some(at);
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_total_recipients(&self, id: CampaignId, total: i64) -> Result<()> {
        if let Some(campaign) = self.campaigns.lock().unwrap().get_mut(&id) {
            campaign.total_recipients = total as i32;
        }
        Ok(())
    }

    async fn update_counters(&self, id: CampaignId, counters: &CampaignCounters) -> Result<()> {
        if let Some(campaign) = self.campaigns.lock().unwrap().get_mut(&id) {
            campaign.total_recipients = counters.total as i32;
            campaign.sent_count = counters.sent as i32;
            campaign.failed_count = counters.failed_total() as i32;
            campaign.opened_count = counters.opened as i32;
            campaign.clicked_count = counters.clicked as i32;
            campaign.unsubscribed_count = counters.unsubscribed as i32;
        }
        Ok(())
    }
}

#[async_trait]
impl RecipientStore for MemoryStores {
    async fn create_batch(
        &self,
        campaign_id: CampaignId,
        inputs: &[CreateRecipient],
    ) -> Result<Vec<Recipient>> {
        let mut recipients = self.recipients.lock().unwrap();
        let mut created = Vec::new();
        for input in inputs {
            let email = input.email.to_lowercase();
            let duplicate = recipients
                .values()
                .any(|r| r.campaign_id == campaign_id && r.email == email);
            if duplicate {
                continue;
            }
            let recipient = recipient_from_input(campaign_id, input);
            recipients.insert(recipient.id, recipient.clone());
            created.push(recipient);
        }
        Ok(created)
    }

    async fn get(&self, id: RecipientId) -> Result<Option<Recipient>> {
        Ok(self.recipient(id))
    }

    async fn find_by_email(
        &self,
        campaign_id: CampaignId,
        email: &str,
    ) -> Result<Option<Recipient>> {
        let email = email.to_lowercase();
        Ok(self
            .recipients
            .lock()
            .unwrap()
            .values()
            .find(|r| r.campaign_id == campaign_id && r.email == email)
            .cloned())
    }

    async fn list_due_pending(
        &self,
        campaign_id: CampaignId,
        limit: i64,
    ) -> Result<Vec<Recipient>> {
        let now = Utc::now();
        let ignore_deadline = self.retries_immediately_due.load(Ordering::SeqCst);
        let mut due: Vec<Recipient> = self
            .recipients
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.campaign_id == campaign_id
                    && r.status == "pending"
                    && (ignore_deadline
                        || r.next_attempt_at.map(|at| at <= now).unwrap_or(true))
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim(&self, id: RecipientId) -> Result<bool> {
        let mut recipients = self.recipients.lock().unwrap();
        let Some(recipient) = recipients.get_mut(&id) else {
            return Ok(false);
        };
        if recipient.status != "pending" {
            return Ok(false);
        }
        recipient.status = RecipientStatus::Sending.to_string();
        Ok(true)
    }

    async fn release_stale_sending(&self, campaign_id: CampaignId) -> Result<u64> {
        let mut recipients = self.recipients.lock().unwrap();
        let mut released = 0;
        for recipient in recipients
            .values_mut()
            .filter(|r| r.campaign_id == campaign_id && r.status == "sending")
        {
            recipient.status = RecipientStatus::Pending.to_string();
            released += 1;
        }
        Ok(released)
    }

    async fn mark_sent(&self, id: RecipientId) -> Result<()> {
        if let Some(recipient) = self.recipients.lock().unwrap().get_mut(&id) {
            recipient.status = RecipientStatus::Sent.to_string();
            recipient.sent_at = Some(Utc::now());
            recipient.error_message = None;
            recipient.next_attempt_at = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: RecipientId, error: &str) -> Result<()> {
        if let Some(recipient) = self.recipients.lock().unwrap().get_mut(&id) {
            recipient.status = RecipientStatus::Failed.to_string();
            recipient.error_message = Some(error.to_string());
            recipient.next_attempt_at = None;
        }
        Ok(())
    }

    async fn mark_bounced(&self, id: RecipientId, error: &str) -> Result<()> {
        if let Some(recipient) = self.recipients.lock().unwrap().get_mut(&id) {
            recipient.status = RecipientStatus::Bounced.to_string();
            recipient.error_message = Some(error.to_string());
            recipient.next_attempt_at = None;
        }
        Ok(())
    }

    async fn mark_unsubscribed(&self, id: RecipientId) -> Result<()> {
        if let Some(recipient) = self.recipients.lock().unwrap().get_mut(&id) {
            recipient.status = RecipientStatus::Unsubscribed.to_string();
            recipient.unsubscribed_at.get_or_insert_with(Utc::now);
            recipient.next_attempt_at = None;
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: RecipientId,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        if let Some(recipient) = self.recipients.lock().unwrap().get_mut(&id) {
            recipient.status = RecipientStatus::Pending.to_string();
            recipient.retry_count = retry_count;
            recipient.next_attempt_at = Some(next_attempt_at);
            recipient.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn record_open(&self, id: RecipientId) -> Result<bool> {
        let mut recipients = self.recipients.lock().unwrap();
        let Some(recipient) = recipients.get_mut(&id) else {
            return Ok(false);
        };
        if recipient.opened_at.is_some() {
            return Ok(false);
        }
        recipient.opened_at = Some(Utc::now());
        Ok(true)
    }

    async fn record_click(&self, id: RecipientId) -> Result<bool> {
        let mut recipients = self.recipients.lock().unwrap();
        let Some(recipient) = recipients.get_mut(&id) else {
            return Ok(false);
        };
        if recipient.clicked_at.is_some() {
            return Ok(false);
        }
        recipient.clicked_at = Some(Utc::now());
        Ok(true)
    }

    async fn counters(&self, campaign_id: CampaignId) -> Result<CampaignCounters> {
        let recipients = self.recipients.lock().unwrap();
        let mut counters = CampaignCounters::default();
        for recipient in recipients.values().filter(|r| r.campaign_id == campaign_id) {
            counters.total += 1;
            match recipient.status.as_str() {
                "pending" => counters.pending += 1,
                "sending" => counters.sending += 1,
                "sent" => counters.sent += 1,
                "failed" => counters.failed += 1,
                "bounced" => counters.bounced += 1,
                "unsubscribed" => counters.unsubscribed += 1,
                _ => {}
            }
            if recipient.opened_at.is_some() {
                counters.opened += 1;
            }
            if recipient.clicked_at.is_some() {
                counters.clicked += 1;
            }
        }
        Ok(counters)
    }

    async fn count_by_campaign(&self, campaign_id: CampaignId) -> Result<i64> {
        Ok(self
            .recipients
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.campaign_id == campaign_id)
            .count() as i64)
    }
}

#[async_trait]
impl EventStore for MemoryStores {
    async fn append(&self, input: CreateDeliveryEvent) -> Result<DeliveryEvent> {
        let event = DeliveryEvent {
            id: Uuid::new_v4(),
            campaign_id: input.campaign_id,
            recipient_id: input.recipient_id,
            email: input.email,
            event_type: input.event_type.to_string(),
            detail: input.detail.unwrap_or_else(|| serde_json::json!({})),
            created_at: Utc::now(),
        };
        self.events.lock().unwrap().push(event.clone());
        Ok(event)
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<DeliveryEvent>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SuppressionStore for MemoryStores {
    async fn upsert(&self, input: CreateSuppression) -> Result<Suppression> {
        let email = input.email.to_lowercase();
        let mut suppressions = self.suppressions.lock().unwrap();
        if let Some(existing) = suppressions
            .iter_mut()
            .find(|s| s.email == email && s.campaign_id == input.campaign_id)
        {
            existing.reason = input.reason;
            existing.expires_at = input.expires_at;
            return Ok(existing.clone());
        }
        let suppression = Suppression {
            id: Uuid::new_v4(),
            email,
            reason: input.reason,
            campaign_id: input.campaign_id,
            expires_at: input.expires_at,
            created_at: Utc::now(),
        };
        suppressions.push(suppression.clone());
        Ok(suppression)
    }

    async fn is_suppressed(&self, email: &str, campaign_id: CampaignId) -> Result<bool> {
        let email = email.to_lowercase();
        let now = Utc::now();
        Ok(self.suppressions.lock().unwrap().iter().any(|s| {
            s.email == email
                && (s.campaign_id.is_none() || s.campaign_id == Some(campaign_id))
                && s.expires_at.map(|at| at > now).unwrap_or(true)
        }))
    }
}

/// Scriptable transport: outcomes are queued per address, defaulting
/// to success
#[derive(Default)]
pub struct MockTransport {
    outcomes: Mutex<HashMap<String, VecDeque<std::result::Result<String, String>>>>,
    sent: Mutex<Vec<OutboundEmail>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next send to `to`
    pub fn fail_next(&self, to: &str, error: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(to.to_lowercase())
            .or_default()
            .push_back(Err(error.to_string()));
    }

    pub fn sent_emails(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, TransportError> {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&email.to.to_lowercase())
            .and_then(|queue| queue.pop_front());

        match outcome {
            Some(Err(error)) => Err(TransportError(error)),
            _ => {
                self.sent.lock().unwrap().push(email.clone());
                Ok(format!("<{}@test>", Uuid::new_v4()))
            }
        }
    }
}

fn campaign_from_input(input: CreateCampaign) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: Uuid::new_v4(),
        name: input.name,
        subject: input.subject,
        html_body: input.html_body,
        text_body: input.text_body,
        from_address: input.from_address,
        from_name: input.from_name,
        reply_to: input.reply_to,
        status: CampaignStatus::Draft.to_string(),
        scheduled_at: input.scheduled_at,
        batch_size: input.batch_size.unwrap_or(100),
        rate_limit_per_second: input.rate_limit_per_second.unwrap_or(10),
        max_retry_attempts: input.max_retry_attempts.unwrap_or(3),
        webhook_enabled: input.webhook_enabled.unwrap_or(false),
        webhook_url: input.webhook_url,
        webhook_secret: input.webhook_secret,
        total_recipients: 0,
        sent_count: 0,
        failed_count: 0,
        opened_count: 0,
        clicked_count: 0,
        unsubscribed_count: 0,
        started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn recipient_from_input(campaign_id: CampaignId, input: &CreateRecipient) -> Recipient {
    let now = Utc::now();
    Recipient {
        id: Uuid::new_v4(),
        campaign_id,
        email: input.email.to_lowercase(),
        first_name: input.first_name.clone(),
        last_name: input.last_name.clone(),
        company: input.company.clone(),
        attributes: input
            .attributes
            .clone()
            .unwrap_or_else(|| serde_json::json!({})),
        status: RecipientStatus::Pending.to_string(),
        retry_count: 0,
        next_attempt_at: None,
        error_message: None,
        sent_at: None,
        opened_at: None,
        clicked_at: None,
        unsubscribed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// A draft campaign with webhooks disabled
pub fn sample_campaign() -> Campaign {
    campaign_from_input(CreateCampaign {
        name: "Launch".to_string(),
        subject: "Hello {{firstname}}".to_string(),
        html_body: "<html><body><p>Hi {{firstname}}</p>\
                    <a href=\"https://example.com/offer\">Offer</a>\
                    <a href=\"{{unsubscribe_url}}\">Unsubscribe</a></body></html>"
            .to_string(),
        text_body: Some("Hi {{firstname}}".to_string()),
        from_address: "news@acme.example.com".to_string(),
        from_name: Some("Acme".to_string()),
        reply_to: None,
        scheduled_at: None,
        batch_size: Some(100),
        rate_limit_per_second: Some(50),
        max_retry_attempts: Some(3),
        webhook_enabled: None,
        webhook_url: None,
        webhook_secret: None,
    })
}

/// A pending recipient for the given campaign
pub fn sample_recipient(campaign_id: CampaignId, email: &str) -> Recipient {
    recipient_from_input(
        campaign_id,
        &CreateRecipient {
            email: email.to_string(),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            company: None,
            attributes: None,
        },
    )
}
