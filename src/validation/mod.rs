//! Data-quality expectations for the weather table.
//!
//! A suite is created once, persisted as JSON, and then only changed through
//! an explicit [`SuiteStore::update_suite`]. Validation evaluates every rule
//! and never stops at the first failure.

mod suite;
mod validator;

pub use suite::{ColumnType, ExpectationSuite, Rule, SuiteStore, default_suite};
pub use validator::{FailureDetail, RuleOutcome, ValidationResult, validate};
