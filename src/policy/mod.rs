//! Policy evaluation for provider-proposed actions.

pub mod evaluator;

pub use evaluator::{evaluate, PolicyDecision};
