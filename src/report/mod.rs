//! Where test results and attachments go

pub mod console;
pub mod json;
pub mod types;

pub use console::ConsoleSink;
pub use json::JsonReportSink;
pub use types::{TestResults, TestStatus};

use anyhow::Result;

/// Receives final test results and attachments from the suite runner
pub trait ReportSink: Send + Sync {
    /// Store a named blob (screenshot, log) for the current run
    fn attach(&self, name: &str, content: &[u8], mime: &str) -> Result<()>;

    fn record_result(
        &self,
        name: &str,
        status: TestStatus,
        duration_ms: u64,
        error: Option<&str>,
    ) -> Result<()>;

    /// A failed attempt of `name` is about to be re-run
    fn record_retry(&self, _name: &str, _attempt: u32) {}

    /// Called once after the last result
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Fans every call out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ReportSink for MultiSink {
    fn attach(&self, name: &str, content: &[u8], mime: &str) -> Result<()> {
        for sink in &self.sinks {
            sink.attach(name, content, mime)?;
        }
        Ok(())
    }

    fn record_result(
        &self,
        name: &str,
        status: TestStatus,
        duration_ms: u64,
        error: Option<&str>,
    ) -> Result<()> {
        for sink in &self.sinks {
            sink.record_result(name, status, duration_ms, error)?;
        }
        Ok(())
    }

    fn record_retry(&self, name: &str, attempt: u32) {
        for sink in &self.sinks {
            sink.record_retry(name, attempt);
        }
    }

    fn finish(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.finish()?;
        }
        Ok(())
    }
}
