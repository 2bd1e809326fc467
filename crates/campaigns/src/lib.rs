//! One-shot campaign broadcasts with deterministic A/B splits and
//! per-variant analytics.

pub mod analytics;
pub mod broadcaster;
pub mod variants;

pub use analytics::{refresh_analytics, DEFAULT_VARIANT};
pub use broadcaster::{BroadcastReport, CampaignBroadcaster};
pub use variants::{assign_variant, bucket, validate_split};
