//! Definition catalog: templates, audiences, sequences and campaigns
//! described by key and name instead of ids.
//!
//! The binary loads one from a file at startup and the HTTP layer accepts the
//! same definitions one at a time. Sequence steps name their template by key.
//! Campaigns and sequences name their audience by catalog name or by id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mailflow_core::clock::Clock;
use mailflow_core::error::{MailflowError, MailflowResult};
use mailflow_core::store::Storage;
use mailflow_core::types::{
    Audience, AudienceKind, Campaign, CampaignContent, Delay, Sequence, SequenceStep, Template,
    TemplateVariable, Variant,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::MailEngine;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDef {
    pub key: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl From<TemplateDef> for Template {
    fn from(def: TemplateDef) -> Self {
        let mut template = Template::new(def.key, def.subject, def.body);
        template.variables = def.variables;
        template.from = def.from;
        template.reply_to = def.reply_to;
        template
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudienceDef {
    pub name: String,
    pub kind: AudienceKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDef {
    /// Template key.
    pub template: String,
    pub delay: Delay,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceDef {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub trigger_event: String,
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub stop_on_reply: bool,
    #[serde(default)]
    pub stop_on_unsubscribe: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignDef {
    pub name: String,
    pub audience: String,
    pub content: CampaignContent,
    #[serde(default)]
    pub variants: Vec<Variant>,
    /// Schedule the campaign instead of leaving it in draft.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A full set of definitions, applied in dependency order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub templates: Vec<TemplateDef>,
    #[serde(default)]
    pub audiences: Vec<AudienceDef>,
    #[serde(default)]
    pub sequences: Vec<SequenceDef>,
    #[serde(default)]
    pub campaigns: Vec<CampaignDef>,
}

impl Catalog {
    /// Read a catalog file; the format follows the extension (TOML, JSON, YAML).
    pub fn load(path: &str) -> MailflowResult<Self> {
        let catalog = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .build()?
            .try_deserialize()?;
        Ok(catalog)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub templates: usize,
    pub audiences: usize,
    pub sequences: usize,
    pub campaigns: usize,
}

/// Audience names registered by the catalog being applied.
type AudienceNames = HashMap<String, Uuid>;

impl MailEngine {
    /// Register every definition in `catalog`. Stops at the first rejected
    /// definition; earlier ones stay registered.
    pub fn load_catalog(&self, catalog: Catalog) -> MailflowResult<CatalogSummary> {
        let mut summary = CatalogSummary::default();
        let mut audiences = AudienceNames::new();

        for def in catalog.templates {
            self.define_template(def)?;
            summary.templates += 1;
        }
        for def in catalog.audiences {
            let name = def.name.clone();
            let id = self.define_audience(def)?;
            audiences.insert(name, id);
            summary.audiences += 1;
        }
        for def in catalog.sequences {
            self.create_sequence(self.sequence_from_def(def, &audiences)?)?;
            summary.sequences += 1;
        }
        for def in catalog.campaigns {
            self.register_campaign(def, &audiences)?;
            summary.campaigns += 1;
        }

        info!(
            templates = summary.templates,
            audiences = summary.audiences,
            sequences = summary.sequences,
            campaigns = summary.campaigns,
            "Catalog loaded"
        );
        Ok(summary)
    }

    pub fn define_template(&self, def: TemplateDef) -> MailflowResult<Uuid> {
        self.create_template(def.into())
    }

    pub fn define_audience(&self, def: AudienceDef) -> MailflowResult<Uuid> {
        self.create_audience(Audience {
            id: Uuid::new_v4(),
            name: def.name,
            kind: def.kind,
        })
    }

    /// The audience, if any, must be given by id.
    pub fn define_sequence(&self, def: SequenceDef) -> MailflowResult<Uuid> {
        self.create_sequence(self.sequence_from_def(def, &AudienceNames::new())?)
    }

    /// The audience must be given by id.
    pub fn define_campaign(&self, def: CampaignDef) -> MailflowResult<Uuid> {
        self.register_campaign(def, &AudienceNames::new())
    }

    fn sequence_from_def(&self, def: SequenceDef, audiences: &AudienceNames) -> MailflowResult<Sequence> {
        let mut sequence = Sequence::new(def.key, def.trigger_event)
            .stop_on_reply(def.stop_on_reply)
            .stop_on_unsubscribe(def.stop_on_unsubscribe);
        if let Some(name) = def.name {
            sequence.name = name;
        }
        sequence.active = def.active;
        sequence.audience_id = def
            .audience
            .as_deref()
            .map(|reference| resolve_audience(reference, audiences))
            .transpose()?;

        for step in def.steps {
            let template = self.store().find_template_by_key(&step.template).ok_or_else(|| {
                MailflowError::Validation(format!(
                    "sequence '{}' references unknown template '{}'",
                    sequence.key, step.template
                ))
            })?;
            let mut built = SequenceStep::new(template.id, step.delay);
            built.condition = step.condition;
            sequence = sequence.step(built);
        }
        Ok(sequence)
    }

    fn register_campaign(&self, def: CampaignDef, audiences: &AudienceNames) -> MailflowResult<Uuid> {
        let audience_id = resolve_audience(&def.audience, audiences)?;
        let mut campaign = Campaign::new(def.name, audience_id, def.content, self.clock().now());
        if !def.variants.is_empty() {
            campaign = campaign.with_variants(def.variants);
        }
        let campaign_id = self.create_campaign(campaign)?;
        if let Some(at) = def.scheduled_at {
            self.schedule_campaign(campaign_id, at)?;
        }
        Ok(campaign_id)
    }
}

fn resolve_audience(reference: &str, audiences: &AudienceNames) -> MailflowResult<Uuid> {
    if let Some(id) = audiences.get(reference) {
        return Ok(*id);
    }
    Uuid::parse_str(reference)
        .map_err(|_| MailflowError::Validation(format!("unknown audience '{reference}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::ContactInput;
    use mailflow_core::config::AppConfig;
    use mailflow_core::types::{CampaignStatus, DelayUnit, Variables};
    use mailflow_core::{ManualClock, MemoryStore};
    use mailflow_delivery::RecordingTransport;
    use serde_json::json;
    use std::sync::Arc;

    const CATALOG_TOML: &str = r#"
[[templates]]
key = "welcome"
subject = "Welcome {{ first_name }}"
body = "Hello"

[[templates]]
key = "nudge"
subject = "Still there?"
body = "Come back"

[[audiences]]
name = "everyone"
kind = { type = "all" }

[[sequences]]
key = "user-onboarding"
trigger_event = "user.registered"
stop_on_reply = true
steps = [
  { template = "welcome", delay = { value = 0, unit = "minutes" } },
  { template = "nudge", delay = { value = 2, unit = "days" }, condition = "contact.total_opened == 0" },
]

[[campaigns]]
name = "Launch"
audience = "everyone"
content = { subject = "Launch", body = "We are live" }
"#;

    fn engine() -> MailEngine {
        MailEngine::builder(AppConfig::default(), Arc::new(MemoryStore::new()))
            .transport(Arc::new(RecordingTransport::new()))
            .clock(Arc::new(ManualClock::new("2024-05-01T09:00:00Z".parse().unwrap())))
            .build()
            .unwrap()
    }

    fn write_catalog(name: &str, contents: &str) -> String {
        let path = std::env::temp_dir().join(format!("mailflow-{}-{name}", Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_catalog_file_registers_everything() {
        let path = write_catalog("catalog.toml", CATALOG_TOML);
        let catalog = Catalog::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let engine = engine();
        let summary = engine.load_catalog(catalog).unwrap();
        assert_eq!(
            summary,
            CatalogSummary { templates: 2, audiences: 1, sequences: 1, campaigns: 1 }
        );

        let sequence = engine.store().find_sequence_by_key("user-onboarding").unwrap();
        assert!(sequence.stop_on_reply);
        assert_eq!(sequence.steps[1].delay.unit, DelayUnit::Days);
        assert_eq!(sequence.steps[1].condition.as_deref(), Some("contact.total_opened == 0"));

        let outcome = engine
            .trigger("user-onboarding", &ContactInput::email("ana@example.com"), Variables::new())
            .unwrap();
        assert_eq!(outcome.steps.len(), 2);

        let campaigns = engine.store().list_campaigns();
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].status, CampaignStatus::Draft);
        assert!(engine.store().get_audience(campaigns[0].audience_id).is_some());
    }

    #[test]
    fn test_missing_catalog_file_is_a_config_error() {
        let err = Catalog::load("/nonexistent/mailflow-catalog.toml").unwrap_err();
        assert!(matches!(err, MailflowError::Config(_)));
    }

    #[test]
    fn test_unknown_template_key_is_rejected() {
        let engine = engine();
        let catalog: Catalog = serde_json::from_value(json!({
            "sequences": [{
                "key": "winback",
                "trigger_event": "user.idle",
                "steps": [{"template": "missing", "delay": {"value": 1, "unit": "days"}}]
            }]
        }))
        .unwrap();
        let err = engine.load_catalog(catalog).unwrap_err();
        assert!(err.is_validation());
        assert!(engine.store().find_sequence_by_key("winback").is_none());
    }

    #[test]
    fn test_campaign_audience_by_id_and_schedule() {
        let engine = engine();
        let audience = engine
            .define_audience(AudienceDef { name: "all".into(), kind: AudienceKind::All })
            .unwrap();
        let at: DateTime<Utc> = "2024-05-02T09:00:00Z".parse().unwrap();
        let campaign_id = engine
            .define_campaign(CampaignDef {
                name: "Digest".into(),
                audience: audience.to_string(),
                content: CampaignContent::new("Digest", "This week"),
                variants: Vec::new(),
                scheduled_at: Some(at),
            })
            .unwrap();
        let campaign = engine.store().get_campaign(campaign_id).unwrap();
        assert_eq!(campaign.status, CampaignStatus::Scheduled);
        assert_eq!(campaign.scheduled_at, Some(at));

        let err = engine
            .define_campaign(CampaignDef {
                name: "Orphan".into(),
                audience: "everyone".into(),
                content: CampaignContent::new("Hi", "Hi"),
                variants: Vec::new(),
                scheduled_at: None,
            })
            .unwrap_err();
        assert!(err.is_validation());
    }
}
