pub mod config;
pub mod report;
pub mod retry;
pub mod runner;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export common items
pub use config::Config;
pub use report::{ReportSink, TestStatus};
pub use retry::{FlakyPolicy, RetryPolicy};
pub use runner::{SuiteRunner, SuiteSummary, TestCase, TestContext};
pub use server::ServerLifecycleManager;
pub use session::{DriverSessionManager, Platform, SessionContext};
