//! Volley - campaign delivery engine entry point

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use volley_common::config::Config;
use volley_core::{
    Dispatcher, Scheduler, SmtpSender, TrackingService, Transport, UnsubscribeService,
    WebhookNotifier,
};
use volley_storage::db::DatabasePool;
use volley_storage::models::CampaignStatus;
use volley_storage::repository::{
    CampaignRepository, CampaignStore, EventRepository, EventStore, RecipientRepository,
    RecipientStore, SuppressionRepository, SuppressionStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so logging can honor its filter
    let config = Config::load()?;
    init_logging(&config);

    info!("Starting Volley delivery engine...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.health_check().await?;

    // Run migrations
    db_pool.migrate().await?;

    // Repositories
    let campaigns: Arc<dyn CampaignStore> =
        Arc::new(CampaignRepository::new(db_pool.clone()));
    let recipients: Arc<dyn RecipientStore> =
        Arc::new(RecipientRepository::new(db_pool.clone()));
    let events: Arc<dyn EventStore> = Arc::new(EventRepository::new(db_pool.clone()));
    let suppressions: Arc<dyn SuppressionStore> =
        Arc::new(SuppressionRepository::new(db_pool.clone()));

    // Outbound transport and services
    let transport: Arc<dyn Transport> = Arc::new(SmtpSender::new(
        &config.smtp,
        &config.server.hostname,
        Duration::from_secs(config.delivery.send_timeout_secs),
    )?);
    let tracking = TrackingService::new(&config.tracking.secret, &config.tracking.api_base_url);
    let unsubscribe = UnsubscribeService::new(
        &config.tracking.secret,
        &config.tracking.unsubscribe_base_url,
    );
    let webhooks = Arc::new(WebhookNotifier::new(Duration::from_secs(
        config.delivery.webhook_timeout_secs,
    ))?);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&campaigns),
        Arc::clone(&recipients),
        Arc::clone(&events),
        Arc::clone(&suppressions),
        Arc::clone(&transport),
        tracking,
        unsubscribe,
        Arc::clone(&webhooks),
        &config.delivery,
    ));

    // Resume campaigns that were mid-send when the process last stopped
    let interrupted = campaigns.list_in_status(CampaignStatus::Sending).await?;
    for campaign in interrupted {
        info!(campaign_id = %campaign.id, name = %campaign.name, "Resuming interrupted campaign");
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.resume_campaign(campaign.id).await {
                error!("Campaign dispatch failed: {}", e);
            }
        });
    }

    // Start the scheduler loop
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&campaigns),
        Arc::clone(&recipients),
        Arc::clone(&dispatcher),
        Duration::from_secs(config.delivery.scheduler_interval_secs),
    ));
    let scheduler_handle = tokio::spawn(scheduler.run());

    info!("Volley started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler_handle.abort();

    info!("Volley shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
