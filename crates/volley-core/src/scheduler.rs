//! Scheduler: promotes due campaigns into dispatch

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use volley_common::Result;
use volley_storage::models::CampaignStatus;
use volley_storage::repository::{CampaignStore, RecipientStore};

use crate::dispatcher::Dispatcher;

/// Periodically scans for `scheduled` campaigns whose time has come
/// and hands them to the dispatcher.
///
/// Promotion is a guarded transition, so overlapping scheduler
/// instances start each campaign once.
pub struct Scheduler {
    campaigns: Arc<dyn CampaignStore>,
    recipients: Arc<dyn RecipientStore>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        recipients: Arc<dyn RecipientStore>,
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
    ) -> Self {
        Self {
            campaigns,
            recipients,
            dispatcher,
            interval,
        }
    }

    /// Run the scheduling loop until the task is aborted
    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "Scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                error!("Scheduler pass failed: {}", e);
            }
        }
    }

    /// One scheduling pass; returns the dispatch tasks it started
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let due = self.campaigns.list_scheduled_due().await?;
        let mut started = Vec::new();

        for campaign in due {
            let recipient_count = self.recipients.count_by_campaign(campaign.id).await?;

            if recipient_count == 0 {
                warn!(campaign_id = %campaign.id, "Scheduled campaign has no recipients");
                self.campaigns
                    .transition(
                        campaign.id,
                        &[CampaignStatus::Scheduled],
                        CampaignStatus::Failed,
                    )
                    .await?;
                continue;
            }

            let claimed = self
                .campaigns
                .transition(
                    campaign.id,
                    &[CampaignStatus::Scheduled],
                    CampaignStatus::Sending,
                )
                .await?;
            if !claimed {
                continue;
            }

            info!(campaign_id = %campaign.id, name = %campaign.name, "Starting scheduled campaign");

            let dispatcher = Arc::clone(&self.dispatcher);
            let campaign_id = campaign.id;
            started.push(tokio::spawn(async move {
                if let Err(e) = dispatcher.run_campaign(campaign_id).await {
                    error!(%campaign_id, "Campaign dispatch failed: {}", e);
                }
            }));
        }

        Ok(started)
    }
}
