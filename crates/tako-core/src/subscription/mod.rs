//! Subscription discovery and evaluation.
//!
//! - `discovery` -- walk the repository cache for `tako.yml` subscriptions
//! - `semver_range` -- schema-version range matching
//! - `evaluator` -- event-type / version / filter matching and input
//!   templating

pub mod discovery;
pub mod evaluator;
pub mod semver_range;
