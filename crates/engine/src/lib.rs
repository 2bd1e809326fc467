//! Mailflow engine: wires segmentation, sequences, delivery, the scheduler
//! and campaigns behind one facade.

pub mod catalog;
pub mod contacts;
pub mod engine;
pub mod workers;

pub use catalog::{AudienceDef, CampaignDef, Catalog, CatalogSummary, SequenceDef, StepDef, TemplateDef};
pub use contacts::{upsert_contact, ContactInput};
pub use engine::{build_transport, EngineBuilder, MailEngine};
pub use workers::EngineWorkers;

pub use mailflow_campaigns::BroadcastReport;
pub use mailflow_delivery::ReconcileSummary;
pub use mailflow_scheduler::TickSummary;
pub use mailflow_sequences::PlanOutcome;
