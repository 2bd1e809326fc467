//! Audience resolution: static lists, everyone, and rule-based segments
//! over contact attributes.

pub mod builder;
pub mod engine;
pub mod predicates;

pub use builder::AudienceBuilder;
pub use engine::SegmentEvaluator;
