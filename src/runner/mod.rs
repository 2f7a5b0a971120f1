//! Suite execution: lanes, sessions, retries and reporting wired together

pub mod context;
pub mod suite;

pub use context::TestContext;
pub use suite::{CaseOutcome, SuiteRunner, SuiteSummary, TestBody, TestCase};
