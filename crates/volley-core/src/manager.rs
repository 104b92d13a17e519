//! Campaign lifecycle operations and engagement recording

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use volley_common::types::{CampaignId, RecipientId};
use volley_common::{Error, Result};
use volley_storage::models::{
    Campaign, CampaignCounters, CampaignStatus, CreateCampaign, CreateDeliveryEvent,
    CreateRecipient, CreateSuppression, EventType, Recipient,
};
use volley_storage::repository::{CampaignStore, EventStore, RecipientStore, SuppressionStore};

use crate::dispatcher::Dispatcher;
use crate::suppression::{UnsubscribeRequest, UnsubscribeService};
use crate::template;
use crate::tracking::TrackingService;
use crate::transport::{OutboundEmail, Transport};
use crate::webhook::{self, events, WebhookNotifier};

/// Campaign progress snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CampaignStats {
    pub campaign_id: CampaignId,
    pub status: String,
    pub total_recipients: i64,
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub bounced: i64,
    pub unsubscribed: i64,
    pub opened: i64,
    pub clicked: i64,
    pub progress_percentage: f64,
}

/// Entry point for campaign control: scheduling, pausing, engagement
/// recording, and unsubscribes
pub struct CampaignManager {
    campaigns: Arc<dyn CampaignStore>,
    recipients: Arc<dyn RecipientStore>,
    events: Arc<dyn EventStore>,
    suppressions: Arc<dyn SuppressionStore>,
    transport: Arc<dyn Transport>,
    tracking: TrackingService,
    unsubscribe: UnsubscribeService,
    webhooks: Arc<WebhookNotifier>,
    dispatcher: Arc<Dispatcher>,
}

impl CampaignManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        recipients: Arc<dyn RecipientStore>,
        events: Arc<dyn EventStore>,
        suppressions: Arc<dyn SuppressionStore>,
        transport: Arc<dyn Transport>,
        tracking: TrackingService,
        unsubscribe: UnsubscribeService,
        webhooks: Arc<WebhookNotifier>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            campaigns,
            recipients,
            events,
            suppressions,
            transport,
            tracking,
            unsubscribe,
            webhooks,
            dispatcher,
        }
    }

    /// Create a draft campaign, validating any webhook destination
    pub async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign> {
        if input.webhook_enabled.unwrap_or(false) {
            let url = input
                .webhook_url
                .as_deref()
                .ok_or_else(|| Error::Validation("Webhook enabled without a URL".to_string()))?;
            webhook::validate_webhook_url(url)?;
        }
        self.campaigns.create(input).await
    }

    /// Add recipients to a campaign, skipping duplicates, and refresh
    /// the total
    pub async fn add_recipients(
        &self,
        campaign_id: CampaignId,
        inputs: &[CreateRecipient],
    ) -> Result<Vec<Recipient>> {
        self.require_campaign(campaign_id).await?;
        let created = self.recipients.create_batch(campaign_id, inputs).await?;
        let total = self.recipients.count_by_campaign(campaign_id).await?;
        self.campaigns
            .set_total_recipients(campaign_id, total)
            .await?;
        Ok(created)
    }

    /// Schedule (or reschedule) a campaign for a future time
    pub async fn schedule(&self, campaign_id: CampaignId, at: DateTime<Utc>) -> Result<()> {
        if at <= Utc::now() {
            return Err(Error::Validation(
                "Scheduled time must be in the future".to_string(),
            ));
        }
        if self.recipients.count_by_campaign(campaign_id).await? == 0 {
            return Err(Error::Validation(
                "Campaign has no recipients".to_string(),
            ));
        }

        let schedulable = [
            CampaignStatus::Draft,
            CampaignStatus::Scheduled,
            CampaignStatus::Paused,
        ];
        if !self
            .campaigns
            .set_schedule(campaign_id, at, &schedulable)
            .await?
        {
            return Err(Error::Validation(
                "Campaign cannot be scheduled from its current state".to_string(),
            ));
        }

        info!(%campaign_id, %at, "Campaign scheduled");
        Ok(())
    }

    /// Cancel a scheduled campaign before it starts
    pub async fn cancel_schedule(&self, campaign_id: CampaignId) -> Result<()> {
        if !self
            .campaigns
            .transition(
                campaign_id,
                &[CampaignStatus::Scheduled],
                CampaignStatus::Cancelled,
            )
            .await?
        {
            return Err(Error::Validation(
                "Only scheduled campaigns can be cancelled".to_string(),
            ));
        }
        info!(%campaign_id, "Campaign cancelled");
        Ok(())
    }

    /// Start sending immediately, bypassing the scheduler
    pub async fn send_now(&self, campaign_id: CampaignId) -> Result<JoinHandle<()>> {
        if self.recipients.count_by_campaign(campaign_id).await? == 0 {
            return Err(Error::Validation(
                "Campaign has no recipients".to_string(),
            ));
        }

        let startable = [
            CampaignStatus::Draft,
            CampaignStatus::Scheduled,
            CampaignStatus::Paused,
        ];
        if !self
            .campaigns
            .transition(campaign_id, &startable, CampaignStatus::Sending)
            .await?
        {
            return Err(Error::Validation(
                "Campaign cannot be started from its current state".to_string(),
            ));
        }

        info!(%campaign_id, "Campaign started");
        Ok(self.spawn_dispatch(campaign_id))
    }

    /// Pause a sending campaign; in-flight sends finish, no new batch
    /// starts
    pub async fn pause(&self, campaign_id: CampaignId) -> Result<()> {
        if !self
            .campaigns
            .transition(
                campaign_id,
                &[CampaignStatus::Sending],
                CampaignStatus::Paused,
            )
            .await?
        {
            return Err(Error::Validation(
                "Only sending campaigns can be paused".to_string(),
            ));
        }
        info!(%campaign_id, "Campaign paused");
        Ok(())
    }

    /// Resume a paused campaign
    pub async fn resume(&self, campaign_id: CampaignId) -> Result<JoinHandle<()>> {
        if !self
            .campaigns
            .transition(
                campaign_id,
                &[CampaignStatus::Paused],
                CampaignStatus::Sending,
            )
            .await?
        {
            return Err(Error::Validation(
                "Only paused campaigns can be resumed".to_string(),
            ));
        }
        info!(%campaign_id, "Campaign resumed");
        Ok(self.spawn_dispatch(campaign_id))
    }

    /// Record an open beacon hit. Returns true on the first open for
    /// this recipient; later opens still append to the event log.
    pub async fn record_open(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        token: &str,
    ) -> Result<bool> {
        if !self.tracking.verify(campaign_id, recipient_id, token) {
            return Err(Error::InvalidToken);
        }
        let campaign = self.require_campaign(campaign_id).await?;
        let recipient = self.require_recipient(campaign_id, recipient_id).await?;

        let first = self.recipients.record_open(recipient_id).await?;
        self.events
            .append(CreateDeliveryEvent {
                campaign_id,
                recipient_id,
                email: recipient.email.clone(),
                event_type: EventType::Opened,
                detail: None,
            })
            .await?;

        if first {
            self.refresh_counters(campaign_id).await?;
            self.fire_webhook(&campaign, &recipient, events::EMAIL_OPENED);
        }
        Ok(first)
    }

    /// Record a click and hand back the original URL to redirect to
    pub async fn record_click(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        token: &str,
        original_url: &str,
    ) -> Result<String> {
        if !self.tracking.verify(campaign_id, recipient_id, token) {
            return Err(Error::InvalidToken);
        }
        let campaign = self.require_campaign(campaign_id).await?;
        let recipient = self.require_recipient(campaign_id, recipient_id).await?;

        let first = self.recipients.record_click(recipient_id).await?;
        self.events
            .append(CreateDeliveryEvent {
                campaign_id,
                recipient_id,
                email: recipient.email.clone(),
                event_type: EventType::Clicked,
                detail: Some(serde_json::json!({ "url": original_url })),
            })
            .await?;

        // A click implies the message was opened
        if self.recipients.record_open(recipient_id).await? {
            self.events
                .append(CreateDeliveryEvent {
                    campaign_id,
                    recipient_id,
                    email: recipient.email.clone(),
                    event_type: EventType::Opened,
                    detail: None,
                })
                .await?;
        }

        self.refresh_counters(campaign_id).await?;
        if first {
            self.fire_webhook(&campaign, &recipient, events::EMAIL_CLICKED);
        }

        Ok(original_url.to_string())
    }

    /// Process a signed unsubscribe request: suppress the address and
    /// update the matching recipient
    pub async fn process_unsubscribe(&self, token: &str) -> Result<UnsubscribeRequest> {
        let request = self.unsubscribe.verify(token)?;

        self.suppressions
            .upsert(CreateSuppression {
                email: request.email.clone(),
                reason: "unsubscribed".to_string(),
                campaign_id: request.campaign_id,
                expires_at: None,
            })
            .await?;

        if let Some(campaign_id) = request.campaign_id {
            if let Some(recipient) = self
                .recipients
                .find_by_email(campaign_id, &request.email)
                .await?
            {
                self.recipients.mark_unsubscribed(recipient.id).await?;
                self.events
                    .append(CreateDeliveryEvent {
                        campaign_id,
                        recipient_id: recipient.id,
                        email: recipient.email.clone(),
                        event_type: EventType::Unsubscribed,
                        detail: None,
                    })
                    .await?;
                self.refresh_counters(campaign_id).await?;

                if let Some(campaign) = self.campaigns.get(campaign_id).await? {
                    self.fire_webhook(&campaign, &recipient, events::EMAIL_UNSUBSCRIBED);
                }
            }
        }

        info!(email = %request.email, "Unsubscribe processed");
        Ok(request)
    }

    /// Progress snapshot recomputed from recipient states
    pub async fn stats(&self, campaign_id: CampaignId) -> Result<CampaignStats> {
        let campaign = self.require_campaign(campaign_id).await?;
        let counters = self.recipients.counters(campaign_id).await?;
        Ok(stats_from(&campaign, &counters))
    }

    /// Send the rendered campaign to a handful of addresses without
    /// touching recipient state or analytics
    pub async fn send_test(&self, campaign_id: CampaignId, addresses: &[String]) -> Result<usize> {
        let campaign = self.require_campaign(campaign_id).await?;
        let mut delivered = 0;

        for address in addresses {
            let unsubscribe_url = self.unsubscribe.url(address, Some(campaign.id));
            let mut vars = std::collections::HashMap::new();
            vars.insert("email".to_string(), address.clone());
            vars.insert("subject".to_string(), campaign.subject.clone());
            vars.insert("unsubscribe_url".to_string(), unsubscribe_url.clone());

            let email = OutboundEmail {
                from: campaign.from_mailbox(),
                reply_to: campaign.reply_to.clone(),
                to: address.clone(),
                subject: format!("[Test] {}", template::render(&campaign.subject, &vars)),
                html_body: template::render(&campaign.html_body, &vars),
                text_body: campaign
                    .text_body
                    .as_ref()
                    .map(|body| template::render(body, &vars)),
                unsubscribe_url: Some(unsubscribe_url),
            };

            match self.transport.send(&email).await {
                Ok(_) => delivered += 1,
                Err(e) => warn!(to = %address, "Test send failed: {}", e),
            }
        }

        Ok(delivered)
    }

    fn spawn_dispatch(&self, campaign_id: CampaignId) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run_campaign(campaign_id).await {
                error!(%campaign_id, "Campaign dispatch failed: {}", e);
            }
        })
    }

    async fn require_campaign(&self, campaign_id: CampaignId) -> Result<Campaign> {
        self.campaigns
            .get(campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Campaign {}", campaign_id)))
    }

    async fn require_recipient(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
    ) -> Result<Recipient> {
        let recipient = self
            .recipients
            .get(recipient_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Recipient {}", recipient_id)))?;
        if recipient.campaign_id != campaign_id {
            return Err(Error::InvalidToken);
        }
        Ok(recipient)
    }

    async fn refresh_counters(&self, campaign_id: CampaignId) -> Result<()> {
        let counters = self.recipients.counters(campaign_id).await?;
        self.campaigns.update_counters(campaign_id, &counters).await
    }

    fn fire_webhook(&self, campaign: &Campaign, recipient: &Recipient, event: &'static str) {
        let Some(config) = webhook::webhook_config_of(campaign) else {
            return;
        };
        self.webhooks.notify(
            config,
            event,
            serde_json::json!({
                "campaign_id": campaign.id,
                "recipient_id": recipient.id,
                "email": recipient.email,
            }),
        );
    }
}

fn stats_from(campaign: &Campaign, counters: &CampaignCounters) -> CampaignStats {
    let terminal = counters.sent + counters.failed_total() + counters.unsubscribed;
    let progress = if counters.total == 0 {
        0.0
    } else {
        (terminal as f64 / counters.total as f64) * 100.0
    };
    CampaignStats {
        campaign_id: campaign.id,
        status: campaign.status.clone(),
        total_recipients: counters.total,
        pending: counters.pending,
        sent: counters.sent,
        failed: counters.failed,
        bounced: counters.bounced,
        unsubscribed: counters.unsubscribed,
        opened: counters.opened,
        clicked: counters.clicked,
        progress_percentage: progress,
    }
}
