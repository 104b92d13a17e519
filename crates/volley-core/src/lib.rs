//! Volley Core - Campaign delivery engine
//!
//! This crate contains the delivery pipeline: the scheduler that
//! promotes due campaigns, the dispatcher that works through a
//! campaign's recipients, the retry classifier, the tracking and
//! unsubscribe token services, the suppression gate, the template
//! renderer, and the webhook notifier.

pub mod dispatcher;
pub mod manager;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod suppression;
pub mod template;
pub mod tracking;
pub mod transport;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatcher::Dispatcher;
pub use manager::{CampaignManager, CampaignStats};
pub use scheduler::Scheduler;
pub use suppression::{UnsubscribeRequest, UnsubscribeService};
pub use tracking::TrackingService;
pub use transport::{OutboundEmail, SmtpSender, Transport, TransportError};
pub use webhook::WebhookNotifier;
