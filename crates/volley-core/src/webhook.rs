//! Webhook notifier for delivery events

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::Serialize;
use sha2::Sha256;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use volley_common::{Error, Result};
use volley_storage::models::Campaign;

type HmacSha256 = Hmac<Sha256>;

/// Webhook event names on the wire
pub mod events {
    pub const EMAIL_SENT: &str = "email.sent";
    pub const EMAIL_FAILED: &str = "email.failed";
    pub const EMAIL_OPENED: &str = "email.opened";
    pub const EMAIL_CLICKED: &str = "email.clicked";
    pub const EMAIL_UNSUBSCRIBED: &str = "email.unsubscribed";
    pub const CAMPAIGN_COMPLETED: &str = "campaign.completed";
}

/// Per-campaign webhook destination
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Option<String>,
}

/// The destination configured on a campaign, if webhooks are enabled
pub fn webhook_config_of(campaign: &Campaign) -> Option<WebhookConfig> {
    if !campaign.webhook_enabled {
        return None;
    }
    campaign.webhook_url.as_ref().map(|url| WebhookConfig {
        url: url.clone(),
        secret: campaign.webhook_secret.clone(),
    })
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'a str,
    timestamp: String,
    data: serde_json::Value,
}

/// Fire-and-forget webhook delivery.
///
/// Delivery is best-effort with a single attempt; a dead endpoint must
/// never block or fail the campaign that triggered it.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Webhook(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Deliver an event without waiting for the result.
    ///
    /// The endpoint URL is validated here so a spawned task never
    /// reaches internal infrastructure.
    pub fn notify(self: &Arc<Self>, config: WebhookConfig, event: &'static str, data: serde_json::Value) {
        if let Err(e) = validate_webhook_url(&config.url) {
            warn!(event, url = %config.url, "Webhook skipped: {}", e);
            return;
        }

        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(&config, event, data).await {
                warn!(event, url = %config.url, "Webhook delivery failed: {}", e);
            }
        });
    }

    /// Deliver one event and wait for the endpoint's response
    pub async fn deliver(
        &self,
        config: &WebhookConfig,
        event: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let payload = WebhookPayload {
            event,
            timestamp: Utc::now().to_rfc3339(),
            data,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| Error::Webhook(format!("Failed to serialize payload: {}", e)))?;

        let mut request = self
            .client
            .post(&config.url)
            .header("Content-Type", "application/json");

        if let Some(secret) = &config.secret {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|e| Error::Webhook(format!("Invalid HMAC key: {}", e)))?;
            mac.update(&body);
            let signature = hex::encode(mac.finalize().into_bytes());
            request = request.header("X-Webhook-Signature", format!("sha256={}", signature));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Webhook(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Webhook(format!(
                "Endpoint returned status {}",
                response.status()
            )));
        }

        debug!(event, url = %config.url, "Webhook delivered");
        Ok(())
    }
}

/// Reject URLs that could reach internal infrastructure
pub fn validate_webhook_url(url_str: &str) -> Result<()> {
    let url =
        Url::parse(url_str).map_err(|e| Error::Webhook(format!("Invalid webhook URL: {}", e)))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::Webhook(format!(
                "Webhook URL scheme '{}' is not allowed",
                scheme
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| Error::Webhook("Webhook URL has no host".to_string()))?;

    let lower_host = host.to_lowercase();
    if lower_host == "localhost"
        || lower_host.ends_with(".local")
        || lower_host.ends_with(".internal")
        || lower_host == "metadata.google.internal"
        || lower_host == "169.254.169.254"
    {
        return Err(Error::Webhook(format!(
            "Webhook URL host '{}' is not allowed (internal address)",
            host
        )));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(Error::Webhook(format!(
                "Webhook URL IP '{}' is not allowed (private range)",
                ip
            )));
        }
    }

    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                // 100.64.0.0/10 (CGNAT)
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7 (ULA)
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 (link-local)
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
