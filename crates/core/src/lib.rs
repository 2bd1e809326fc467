//! Shared domain model for the mail sequencing & delivery engine: entity
//! types, errors, configuration, clock, event bus, storage contract and the
//! template renderer.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod memory;
pub mod store;
pub mod templates;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{MailflowError, MailflowResult};
pub use memory::MemoryStore;
pub use store::Storage;
pub use templates::{Renderer, TemplateRenderer};
