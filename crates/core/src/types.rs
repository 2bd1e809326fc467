use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Variable payload carried from a trigger into rendering and conditions.
pub type Variables = serde_json::Map<String, serde_json::Value>;

// ─── Contacts ───────────────────────────────────────────────────────────────

/// A recipient. Never deleted, only suppressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub subscribed: bool,
    pub status: ContactStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub engagement: EngagementStats,
    pub signup_date: DateTime<Utc>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

impl Contact {
    /// A fresh active, subscribed contact.
    pub fn new(email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            first_name: None,
            last_name: None,
            location: None,
            subscribed: true,
            status: ContactStatus::Active,
            tags: BTreeSet::new(),
            custom_fields: BTreeMap::new(),
            engagement: EngagementStats::default(),
            signup_date: now,
            last_activity: None,
            unsubscribed_at: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_custom(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.custom_fields.insert(name.into(), value);
        self
    }

    /// Subscribed and in good standing.
    pub fn is_mailable(&self) -> bool {
        self.subscribed && self.status == ContactStatus::Active
    }

    /// Flat attribute map used as the base of the rendering context.
    /// Custom fields come first so the built-in attributes win on collision.
    pub fn attributes(&self) -> Variables {
        let mut vars = Variables::new();
        for (name, value) in &self.custom_fields {
            vars.insert(name.clone(), value.clone());
        }
        vars.insert("email".into(), self.email.clone().into());
        if let Some(first) = &self.first_name {
            vars.insert("first_name".into(), first.clone().into());
        }
        if let Some(last) = &self.last_name {
            vars.insert("last_name".into(), last.clone().into());
        }
        if let Some(location) = &self.location {
            vars.insert("location".into(), location.clone().into());
        }
        vars
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    Bounced,
    Complained,
    Suppressed,
}

/// Per-contact engagement counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementStats {
    pub total_sent: u64,
    pub total_opened: u64,
    pub total_clicked: u64,
    pub engagement_score: f64,
}

impl EngagementStats {
    /// Clicks weigh twice as much as opens; capped at 100.
    pub fn recompute_score(&mut self) {
        self.engagement_score = if self.total_sent == 0 {
            0.0
        } else {
            let weighted = (self.total_opened + 2 * self.total_clicked) as f64;
            (100.0 * weighted / (2 * self.total_sent) as f64).min(100.0)
        };
    }
}

// ─── Audiences ──────────────────────────────────────────────────────────────

/// A named set of contacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audience {
    pub id: Uuid,
    pub name: String,
    pub kind: AudienceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AudienceKind {
    Static { contact_ids: Vec<Uuid> },
    Dynamic {
        rules: Vec<SegmentRule>,
        logic: RuleLogic,
    },
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleLogic {
    /// Every rule must hold.
    All,
    /// At least one rule must hold.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRule {
    pub field: RuleField,
    pub operator: RuleOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl SegmentRule {
    pub fn new(field: RuleField, operator: RuleOperator, value: Option<serde_json::Value>) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    /// Structural check run when an audience is saved. Evaluation never calls
    /// this; a malformed rule there just evaluates false.
    pub fn validate(&self) -> Result<(), String> {
        if let RuleField::Custom(name) = &self.field {
            if name.trim().is_empty() {
                return Err("custom rule field must name a custom field".to_string());
            }
        }
        match (self.operator.needs_value(), &self.value) {
            (true, None) | (true, Some(serde_json::Value::Null)) => Err(format!(
                "operator {:?} on {} requires a value",
                self.operator,
                self.field.label()
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    Tags,
    Location,
    Engagement,
    #[serde(alias = "signupDate")]
    SignupDate,
    #[serde(alias = "lastActivity")]
    LastActivity,
    Custom(String),
}

impl RuleField {
    pub fn label(&self) -> String {
        match self {
            RuleField::Tags => "tags".to_string(),
            RuleField::Location => "location".to_string(),
            RuleField::Engagement => "engagement".to_string(),
            RuleField::SignupDate => "signup_date".to_string(),
            RuleField::LastActivity => "last_activity".to_string(),
            RuleField::Custom(name) => format!("custom.{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Contains,
    NotContains,
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
}

impl RuleOperator {
    pub fn needs_value(self) -> bool {
        !matches!(self, RuleOperator::IsEmpty | RuleOperator::IsNotEmpty)
    }
}

// ─── Templates ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub key: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    /// Overrides the global default sender.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Template {
    pub fn new(key: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            subject: subject.into(),
            body: body.into(),
            variables: Vec::new(),
            from: None,
            reply_to: None,
        }
    }

    pub fn with_variable(mut self, variable: TemplateVariable) -> Self {
        self.variables.push(variable);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl TemplateVariable {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: Some(default.into()),
        }
    }
}

// ─── Sequences ──────────────────────────────────────────────────────────────

/// An ordered list of delayed, template-bound steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub trigger_event: String,
    pub steps: Vec<SequenceStep>,
    #[serde(default)]
    pub stop_on_reply: bool,
    #[serde(default)]
    pub stop_on_unsubscribe: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Restricts event-based triggering to members of this audience.
    #[serde(default)]
    pub audience_id: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

impl Sequence {
    pub fn new(key: impl Into<String>, trigger_event: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            id: Uuid::new_v4(),
            name: key.clone(),
            key,
            trigger_event: trigger_event.into(),
            steps: Vec::new(),
            stop_on_reply: false,
            stop_on_unsubscribe: false,
            active: true,
            audience_id: None,
        }
    }

    pub fn step(mut self, step: SequenceStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn stop_on_unsubscribe(mut self, on: bool) -> Self {
        self.stop_on_unsubscribe = on;
        self
    }

    pub fn stop_on_reply(mut self, on: bool) -> Self {
        self.stop_on_reply = on;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub template_id: Uuid,
    pub delay: Delay,
    #[serde(default)]
    pub condition: Option<String>,
}

impl SequenceStep {
    pub fn new(template_id: Uuid, delay: Delay) -> Self {
        Self {
            template_id,
            delay,
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub value: u32,
    pub unit: DelayUnit,
}

impl Delay {
    pub fn minutes(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Minutes,
        }
    }

    pub fn hours(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Hours,
        }
    }

    pub fn days(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Days,
        }
    }

    pub fn weeks(value: u32) -> Self {
        Self {
            value,
            unit: DelayUnit::Weeks,
        }
    }

    /// `None` when the delay does not fit in a `Duration`.
    pub fn to_duration(self) -> Option<Duration> {
        let value = i64::from(self.value);
        match self.unit {
            DelayUnit::Minutes => Duration::try_minutes(value),
            DelayUnit::Hours => Duration::try_hours(value),
            DelayUnit::Days => Duration::try_days(value),
            DelayUnit::Weeks => Duration::try_weeks(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

// ─── Jobs ───────────────────────────────────────────────────────────────────

/// One scheduled send attempt for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub template_id: Option<Uuid>,
    pub sequence: Option<SequenceRef>,
    pub campaign: Option<CampaignRef>,
    #[serde(default)]
    pub variables: Variables,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Set while `processing`; used to recover claims of crashed workers.
    pub claimed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn for_sequence_step(
        contact_id: Uuid,
        template_id: Uuid,
        sequence: SequenceRef,
        variables: Variables,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::base(contact_id, Some(template_id), Some(sequence), None, variables, scheduled_for, now)
    }

    pub fn for_campaign(
        contact_id: Uuid,
        campaign: CampaignRef,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::base(contact_id, None, None, Some(campaign), Variables::new(), scheduled_for, now)
    }

    fn base(
        contact_id: Uuid,
        template_id: Option<Uuid>,
        sequence: Option<SequenceRef>,
        campaign: Option<CampaignRef>,
        variables: Variables,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id,
            template_id,
            sequence,
            campaign,
            variables,
            scheduled_for,
            status: JobStatus::Scheduled,
            attempts: 0,
            last_attempt: None,
            claimed_at: None,
            error: None,
            log_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceRef {
    pub sequence_id: Uuid,
    pub step_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CampaignRef {
    pub campaign_id: Uuid,
    /// `None` when the campaign has no A/B split.
    pub variant: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::Failed | JobStatus::Cancelled)
    }
}

// ─── Logs ───────────────────────────────────────────────────────────────────

/// Durable record of a dispatched email and its delivery lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub job_id: Uuid,
    pub template_id: Option<Uuid>,
    pub sequence: Option<SequenceRef>,
    pub campaign: Option<CampaignRef>,
    pub subject: String,
    pub status: LogStatus,
    pub provider_message_id: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub complained_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub open_count: u64,
    pub click_count: u64,
    /// Provider event ids already folded into this row.
    #[serde(default)]
    pub applied_event_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// Log status lattice: `pending < sent < delivered < opened < clicked`, with
/// `bounced`, `complained` and `unsubscribed` absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
}

impl LogStatus {
    pub fn is_absorbing(self) -> bool {
        matches!(
            self,
            LogStatus::Bounced | LogStatus::Complained | LogStatus::Unsubscribed
        )
    }

    fn rank(self) -> u8 {
        match self {
            LogStatus::Pending => 0,
            LogStatus::Sent => 1,
            LogStatus::Delivered => 2,
            LogStatus::Opened => 3,
            LogStatus::Clicked => 4,
            LogStatus::Bounced | LogStatus::Complained | LogStatus::Unsubscribed => u8::MAX,
        }
    }

    /// Join of the current status with an observed one. Forward-only on the
    /// chain; the first absorbing status sticks.
    pub fn advance(self, observed: LogStatus) -> LogStatus {
        if self.is_absorbing() {
            return self;
        }
        if observed.is_absorbing() || observed.rank() > self.rank() {
            observed
        } else {
            self
        }
    }
}

// ─── Delivery events ────────────────────────────────────────────────────────

/// Provider webhook event, normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    #[serde(alias = "providerMessageId")]
    pub provider_message_id: String,
    #[serde(rename = "type")]
    pub kind: DeliveryEventKind,
    pub timestamp: DateTime<Utc>,
    /// Provider-assigned event id, used for dedupe when present.
    #[serde(default, alias = "eventId")]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
}

impl DeliveryEventKind {
    pub fn log_status(self) -> LogStatus {
        match self {
            DeliveryEventKind::Delivered => LogStatus::Delivered,
            DeliveryEventKind::Opened => LogStatus::Opened,
            DeliveryEventKind::Clicked => LogStatus::Clicked,
            DeliveryEventKind::Bounced => LogStatus::Bounced,
            DeliveryEventKind::Complained => LogStatus::Complained,
            DeliveryEventKind::Unsubscribed => LogStatus::Unsubscribed,
        }
    }
}

// ─── Campaigns ──────────────────────────────────────────────────────────────

/// One-shot bulk send to an audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub audience_id: Uuid,
    pub content: CampaignContent,
    pub status: CampaignStatus,
    #[serde(default)]
    pub ab_testing: Option<AbTesting>,
    #[serde(default)]
    pub analytics: CampaignAnalytics,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(
        name: impl Into<String>,
        audience_id: Uuid,
        content: CampaignContent,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            audience_id,
            content,
            status: CampaignStatus::Draft,
            ab_testing: None,
            analytics: CampaignAnalytics::default(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
        self.ab_testing = Some(AbTesting {
            enabled: true,
            variants,
        });
        self
    }

    /// Variants in effect, `None` when A/B testing is off.
    pub fn active_variants(&self) -> Option<&[Variant]> {
        self.ab_testing
            .as_ref()
            .filter(|ab| ab.enabled)
            .map(|ab| ab.variants.as_slice())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContent {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl CampaignContent {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            variables: Vec::new(),
            from: None,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTesting {
    pub enabled: bool,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub subject: String,
    /// Falls back to the campaign body when absent.
    #[serde(default)]
    pub body: Option<String>,
    pub percentage: u8,
}

impl Variant {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, percentage: u8) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            body: None,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Cancelled,
}

/// Aggregated delivery outcome of a campaign, overall and per variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignAnalytics {
    pub recipients: u64,
    pub totals: VariantAnalytics,
    pub variants: BTreeMap<String, VariantAnalytics>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantAnalytics {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub bounced: u64,
    pub complained: u64,
    pub unsubscribed: u64,
    pub open_rate: f64,
    pub click_rate: f64,
}

impl VariantAnalytics {
    pub fn recalculate_rates(&mut self) {
        if self.sent > 0 {
            let sent = self.sent as f64;
            self.open_rate = self.opened as f64 / sent;
            self.click_rate = self.clicked as f64 / sent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_conversion() {
        assert_eq!(Delay::minutes(0).to_duration(), Some(Duration::zero()));
        assert_eq!(Delay::hours(2).to_duration(), Some(Duration::minutes(120)));
        assert_eq!(Delay::days(1).to_duration(), Some(Duration::hours(24)));
        assert_eq!(Delay::weeks(1).to_duration(), Some(Duration::days(7)));
        assert_eq!(
            Delay::weeks(u32::MAX).to_duration(),
            Some(Duration::weeks(i64::from(u32::MAX)))
        );
    }

    #[test]
    fn test_log_status_lattice() {
        assert_eq!(LogStatus::Sent.advance(LogStatus::Opened), LogStatus::Opened);
        assert_eq!(LogStatus::Clicked.advance(LogStatus::Delivered), LogStatus::Clicked);
        assert_eq!(LogStatus::Clicked.advance(LogStatus::Bounced), LogStatus::Bounced);
        assert_eq!(LogStatus::Unsubscribed.advance(LogStatus::Clicked), LogStatus::Unsubscribed);
        assert_eq!(LogStatus::Complained.advance(LogStatus::Bounced), LogStatus::Complained);
    }

    #[test]
    fn test_engagement_score() {
        let mut stats = EngagementStats {
            total_sent: 4,
            total_opened: 2,
            total_clicked: 1,
            engagement_score: 0.0,
        };
        stats.recompute_score();
        assert!((stats.engagement_score - 50.0).abs() < f64::EPSILON);

        stats.total_sent = 0;
        stats.recompute_score();
        assert_eq!(stats.engagement_score, 0.0);
    }

    #[test]
    fn test_rule_validation() {
        let ok = SegmentRule::new(RuleField::Tags, RuleOperator::Contains, Some("vip".into()));
        assert!(ok.validate().is_ok());

        let empty = SegmentRule::new(RuleField::Location, RuleOperator::IsEmpty, None);
        assert!(empty.validate().is_ok());

        let missing = SegmentRule::new(RuleField::Engagement, RuleOperator::GreaterThan, None);
        assert!(missing.validate().is_err());

        let unnamed = SegmentRule::new(RuleField::Custom(" ".into()), RuleOperator::IsEmpty, None);
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_delivery_event_wire_format() {
        let json = r#"{"providerMessageId":"msg-1","type":"opened","timestamp":"2024-03-01T10:00:00Z","eventId":"ev-9"}"#;
        let event: DeliveryEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.provider_message_id, "msg-1");
        assert_eq!(event.kind, DeliveryEventKind::Opened);
        assert_eq!(event.event_id.as_deref(), Some("ev-9"));
    }

    #[test]
    fn test_contact_attributes() {
        let contact = Contact::new("ana@example.com", Utc::now())
            .with_location("Lisbon")
            .with_custom("plan", serde_json::json!("pro"))
            .with_custom("email", serde_json::json!("shadowed"));
        let attrs = contact.attributes();
        assert_eq!(attrs["email"], "ana@example.com");
        assert_eq!(attrs["location"], "Lisbon");
        assert_eq!(attrs["plan"], "pro");
    }

    fn any_status() -> impl proptest::strategy::Strategy<Value = LogStatus> {
        use proptest::prelude::*;
        prop_oneof![
            Just(LogStatus::Sent),
            Just(LogStatus::Delivered),
            Just(LogStatus::Opened),
            Just(LogStatus::Clicked),
            Just(LogStatus::Bounced),
            Just(LogStatus::Complained),
            Just(LogStatus::Unsubscribed),
        ]
    }

    proptest::proptest! {
        #[test]
        fn prop_log_status_never_regresses(observed in proptest::collection::vec(any_status(), 0..16)) {
            let mut status = LogStatus::Sent;
            let mut absorbed: Option<LogStatus> = None;
            for next in observed {
                let advanced = status.advance(next);
                proptest::prop_assert!(advanced.rank() >= status.rank());
                if let Some(first) = absorbed {
                    proptest::prop_assert_eq!(advanced, first);
                } else if advanced.is_absorbing() {
                    absorbed = Some(advanced);
                }
                status = advanced;
            }
        }
    }
}
