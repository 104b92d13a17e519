//! Repository layer for data access

pub mod campaigns;
pub mod events;
pub mod recipients;
pub mod suppressions;

// Re-export concrete repository implementations with simple names
pub use campaigns::DbCampaignRepository as CampaignRepository;
pub use events::DbEventRepository as EventRepository;
pub use recipients::DbRecipientRepository as RecipientRepository;
pub use suppressions::DbSuppressionRepository as SuppressionRepository;

// Re-export repository traits
pub use campaigns::CampaignStore;
pub use events::EventStore;
pub use recipients::RecipientStore;
pub use suppressions::SuppressionStore;
