//! Campaign analytics: per-variant delivery funnel aggregated from Logs.

use chrono::{DateTime, Utc};
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::store::Storage;
use mailflow_core::types::{CampaignAnalytics, Log, VariantAnalytics};
use tracing::debug;
use uuid::Uuid;

/// Bucket for campaign logs sent without an A/B split.
pub const DEFAULT_VARIANT: &str = "default";

fn count(stats: &mut VariantAnalytics, log: &Log) {
    stats.sent += 1;
    stats.delivered += u64::from(log.delivered_at.is_some());
    stats.opened += u64::from(log.opened_at.is_some());
    stats.clicked += u64::from(log.clicked_at.is_some());
    stats.bounced += u64::from(log.bounced_at.is_some());
    stats.complained += u64::from(log.complained_at.is_some());
    stats.unsubscribed += u64::from(log.unsubscribed_at.is_some());
}

/// Fold logs into funnel counts and open/click rates. Each log counts once
/// per stage, however many opens or clicks it saw.
pub fn aggregate(logs: &[Log], recipients: u64, now: DateTime<Utc>) -> CampaignAnalytics {
    let mut analytics = CampaignAnalytics {
        recipients,
        updated_at: Some(now),
        ..CampaignAnalytics::default()
    };
    for log in logs {
        let variant = log
            .campaign
            .as_ref()
            .and_then(|c| c.variant.clone())
            .unwrap_or_else(|| DEFAULT_VARIANT.to_string());
        count(analytics.variants.entry(variant).or_default(), log);
        count(&mut analytics.totals, log);
    }
    analytics.totals.recalculate_rates();
    for stats in analytics.variants.values_mut() {
        stats.recalculate_rates();
    }
    analytics
}

/// Recompute and store `Campaign.analytics`.
pub fn refresh_analytics(
    store: &dyn Storage,
    campaign_id: Uuid,
    now: DateTime<Utc>,
) -> MailflowResult<CampaignAnalytics> {
    if store.get_campaign(campaign_id).is_none() {
        return Err(MailflowError::not_found("campaign", campaign_id));
    }
    let logs = store.logs_for_campaign(campaign_id);
    let recipients = store.jobs_for_campaign(campaign_id).len() as u64;
    let analytics = aggregate(&logs, recipients, now);
    store.update_campaign(campaign_id, &mut |campaign| {
        campaign.analytics = analytics.clone();
    })?;
    debug!(
        campaign_id = %campaign_id,
        sent = analytics.totals.sent,
        opened = analytics.totals.opened,
        "Campaign analytics refreshed"
    );
    Ok(analytics)
}
