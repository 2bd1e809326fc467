//! Sequence planning, step conditions and the job lifecycle rules shared by
//! the scheduler and the reconciler.

pub mod evaluator;
pub mod expr;
pub mod halt;
pub mod planner;
pub mod state_machine;

pub use evaluator::ConditionEvaluator;
pub use halt::{HaltReason, SequenceHalter};
pub use planner::{PlanOutcome, SequencePlanner};
pub use state_machine::JobStateMachine;
