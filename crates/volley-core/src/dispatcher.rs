//! Batch dispatcher: works a campaign's recipients to completion

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use volley_common::config::DeliveryConfig;
use volley_common::types::CampaignId;
use volley_common::Result;
use volley_storage::models::{
    Campaign, CampaignCounters, CampaignStatus, CreateDeliveryEvent, EventType, Recipient,
};
use volley_storage::repository::{CampaignStore, EventStore, RecipientStore, SuppressionStore};

use crate::rate_limiter::RateLimiter;
use crate::retry;
use crate::suppression::UnsubscribeService;
use crate::template;
use crate::tracking::TrackingService;
use crate::transport::{OutboundEmail, Transport};
use crate::webhook::{self, events, WebhookNotifier};

/// Drives one campaign from `sending` to a terminal state.
///
/// Recipients are claimed individually with a guarded update, so
/// multiple dispatchers racing over the same campaign send each
/// message at most once.
pub struct Dispatcher {
    campaigns: Arc<dyn CampaignStore>,
    recipients: Arc<dyn RecipientStore>,
    events: Arc<dyn EventStore>,
    suppressions: Arc<dyn SuppressionStore>,
    transport: Arc<dyn Transport>,
    tracking: TrackingService,
    unsubscribe: UnsubscribeService,
    webhooks: Arc<WebhookNotifier>,
    concurrency: usize,
    poll_interval: Duration,
    send_timeout: Duration,
}

impl Dispatcher {
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
        delivery: &DeliveryConfig,
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
            concurrency: delivery.concurrency,
            poll_interval: Duration::from_secs(delivery.poll_interval_secs),
            send_timeout: Duration::from_secs(delivery.send_timeout_secs),
        }
    }

    /// Pick up a campaign a previous process was sending when it died.
    ///
    /// Recipients stranded in `sending` are returned to `pending` first;
    /// without that the campaign can never satisfy the completion check.
    pub async fn resume_campaign(self: Arc<Self>, campaign_id: CampaignId) -> Result<()> {
        let released = self.recipients.release_stale_sending(campaign_id).await?;
        if released > 0 {
            info!(%campaign_id, released, "Released recipients stranded mid-send");
        }
        self.run_campaign(campaign_id).await
    }

    /// Process a campaign until every recipient reached a terminal
    /// state or the campaign is paused or cancelled
    pub async fn run_campaign(self: Arc<Self>, campaign_id: CampaignId) -> Result<()> {
        let Some(campaign) = self.campaigns.get(campaign_id).await? else {
            warn!(%campaign_id, "Campaign vanished before dispatch");
            return Ok(());
        };

        info!(%campaign_id, name = %campaign.name, "Dispatching campaign");

        let limiter = Arc::new(RateLimiter::new(
            campaign.rate_limit_per_second.max(1) as usize,
        ));
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));

        loop {
            let Some(campaign) = self.campaigns.get(campaign_id).await? else {
                return Ok(());
            };
            match campaign.status_enum() {
                Some(CampaignStatus::Sending) => {}
                _ => {
                    info!(%campaign_id, status = %campaign.status, "Dispatch stopped");
                    return Ok(());
                }
            }

            let batch = self
                .recipients
                .list_due_pending(campaign_id, campaign.batch_size.max(1) as i64)
                .await?;

            if batch.is_empty() {
                let counters = self.recipients.counters(campaign_id).await?;
                self.campaigns.update_counters(campaign_id, &counters).await?;

                if counters.is_finished() {
                    self.finalize(&campaign, &counters).await?;
                    return Ok(());
                }

                // Retries are still pending; wait for their deadlines
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let campaign = Arc::new(campaign);
            let mut tasks = JoinSet::new();

            for recipient in batch {
                let dispatcher = Arc::clone(&self);
                let campaign = Arc::clone(&campaign);
                let limiter = Arc::clone(&limiter);
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");

                tasks.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = dispatcher
                        .process_recipient(&campaign, recipient, &limiter)
                        .await
                    {
                        error!("Recipient processing failed: {}", e);
                    }
                });
            }

            while tasks.join_next().await.is_some() {}

            let counters = self.recipients.counters(campaign_id).await?;
            self.campaigns.update_counters(campaign_id, &counters).await?;
        }
    }

    async fn process_recipient(
        &self,
        campaign: &Campaign,
        recipient: Recipient,
        limiter: &RateLimiter,
    ) -> Result<()> {
        // Guarded claim: first worker wins, everyone else drops out
        if !self.recipients.claim(recipient.id).await? {
            return Ok(());
        }

        if self
            .suppressions
            .is_suppressed(&recipient.email, campaign.id)
            .await?
        {
            debug!(email = %recipient.email, "Recipient suppressed, skipping send");
            self.recipients.mark_unsubscribed(recipient.id).await?;
            self.append_event(campaign, &recipient, EventType::Unsubscribed, None)
                .await?;
            self.fire_webhook(campaign, &recipient, events::EMAIL_UNSUBSCRIBED, None);
            return Ok(());
        }

        let email = self.build_email(campaign, &recipient);

        limiter.acquire().await;

        let outcome = match tokio::time::timeout(self.send_timeout, self.transport.send(&email))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(crate::transport::TransportError(format!(
                "Send timeout after {}s",
                self.send_timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(message_id) => {
                debug!(email = %recipient.email, %message_id, "Sent");
                self.recipients.mark_sent(recipient.id).await?;
                self.append_event(
                    campaign,
                    &recipient,
                    EventType::Sent,
                    Some(serde_json::json!({ "message_id": message_id })),
                )
                .await?;
                self.fire_webhook(campaign, &recipient, events::EMAIL_SENT, None);
            }
            Err(e) => {
                let error = e.to_string();
                self.handle_failure(campaign, &recipient, &error).await?;
            }
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        error: &str,
    ) -> Result<()> {
        if retry::should_retry(error, recipient.retry_count, campaign.max_retry_attempts) {
            let attempt = recipient.retry_count + 1;
            let next_attempt_at = Utc::now() + retry::backoff_delay(attempt);
            debug!(
                email = %recipient.email,
                attempt,
                %next_attempt_at,
                "Scheduling retry: {}",
                error
            );
            self.recipients
                .schedule_retry(recipient.id, attempt, next_attempt_at, error)
                .await?;
            return Ok(());
        }

        if retry::is_hard_bounce(error) {
            warn!(email = %recipient.email, "Hard bounce: {}", error);
            self.recipients.mark_bounced(recipient.id, error).await?;
            self.append_event(
                campaign,
                recipient,
                EventType::Bounced,
                Some(serde_json::json!({ "error": error })),
            )
            .await?;
        } else {
            warn!(email = %recipient.email, "Delivery failed: {}", error);
            self.recipients.mark_failed(recipient.id, error).await?;
            self.append_event(
                campaign,
                recipient,
                EventType::Failed,
                Some(serde_json::json!({ "error": error })),
            )
            .await?;
        }

        self.fire_webhook(
            campaign,
            recipient,
            events::EMAIL_FAILED,
            Some(serde_json::json!({ "error": error })),
        );
        Ok(())
    }

    /// Render, inject tracking, and assemble the outbound message
    fn build_email(&self, campaign: &Campaign, recipient: &Recipient) -> OutboundEmail {
        let unsubscribe_url = self
            .unsubscribe
            .url(&recipient.email, Some(campaign.id));
        let vars = template::recipient_vars(recipient, &campaign.subject, &unsubscribe_url);

        let subject = template::render(&campaign.subject, &vars);
        let html = template::render(&campaign.html_body, &vars);
        let html = self.tracking.inject(&html, campaign.id, recipient.id);
        let text = campaign
            .text_body
            .as_ref()
            .map(|body| template::render(body, &vars));

        OutboundEmail {
            from: campaign.from_mailbox(),
            reply_to: campaign.reply_to.clone(),
            to: recipient.email.clone(),
            subject,
            html_body: html,
            text_body: text,
            unsubscribe_url: Some(unsubscribe_url),
        }
    }

    async fn finalize(&self, campaign: &Campaign, counters: &CampaignCounters) -> Result<()> {
        let all_failed = counters.total > 0 && counters.failed_total() == counters.total;
        let final_status = if all_failed {
            CampaignStatus::Failed
        } else {
            CampaignStatus::Completed
        };

        // The guarded transition makes the completion webhook fire
        // exactly once even with concurrent dispatchers
        let transitioned = self
            .campaigns
            .transition(campaign.id, &[CampaignStatus::Sending], final_status)
            .await?;

        if !transitioned {
            return Ok(());
        }

        info!(
            campaign_id = %campaign.id,
            status = %final_status,
            sent = counters.sent,
            failed = counters.failed_total(),
            "Campaign finished"
        );

        if let Some(config) = webhook::webhook_config_of(campaign) {
            self.webhooks.notify(
                config,
                events::CAMPAIGN_COMPLETED,
                serde_json::json!({
                    "campaign_id": campaign.id,
                    "status": final_status.to_string(),
                    "total_recipients": counters.total,
                    "sent": counters.sent,
                    "failed": counters.failed_total(),
                    "unsubscribed": counters.unsubscribed,
                }),
            );
        }

        Ok(())
    }

    async fn append_event(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        event_type: EventType,
        detail: Option<serde_json::Value>,
    ) -> Result<()> {
        self.events
            .append(CreateDeliveryEvent {
                campaign_id: campaign.id,
                recipient_id: recipient.id,
                email: recipient.email.clone(),
                event_type,
                detail,
            })
            .await?;
        Ok(())
    }

    fn fire_webhook(
        &self,
        campaign: &Campaign,
        recipient: &Recipient,
        event: &'static str,
        extra: Option<serde_json::Value>,
    ) {
        let Some(config) = webhook::webhook_config_of(campaign) else {
            return;
        };
        let mut data = serde_json::json!({
            "campaign_id": campaign.id,
            "recipient_id": recipient.id,
            "email": recipient.email,
        });
        if let Some(serde_json::Value::Object(extra)) = extra {
            if let serde_json::Value::Object(map) = &mut data {
                map.extend(extra);
            }
        }
        self.webhooks.notify(config, event, data);
    }
}
