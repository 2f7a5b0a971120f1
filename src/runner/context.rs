use crate::config::Config;
use crate::report::ReportSink;
use crate::session::{DriverSession, SessionContext};
use anyhow::Result;

/// What a test body gets to work with during one attempt
pub struct TestContext<'a> {
    /// Name the test is registered under
    pub test_name: &'a str,

    /// 1 for the first run, incremented on every retry
    pub attempt: u32,

    /// Index of the execution lane running the test
    pub lane: usize,

    config: &'a Config,
    session: &'a mut SessionContext,
    sink: &'a dyn ReportSink,
}

impl<'a> TestContext<'a> {
    pub(crate) fn new(
        test_name: &'a str,
        attempt: u32,
        lane: usize,
        config: &'a Config,
        session: &'a mut SessionContext,
        sink: &'a dyn ReportSink,
    ) -> Self {
        Self {
            test_name,
            attempt,
            lane,
            config,
            session,
            sink,
        }
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    /// The lane's live session
    pub fn session(&self) -> Result<&DriverSession> {
        self.session
            .current()
            .ok_or_else(|| anyhow::anyhow!("No active session for '{}'", self.test_name))
    }

    /// Direct access to the lane's session slot, e.g. to quit and re-init
    pub fn sessions(&mut self) -> &mut SessionContext {
        self.session
    }

    pub fn is_android(&self) -> bool {
        self.session.is_android()
    }

    pub fn is_ios(&self) -> bool {
        self.session.is_ios()
    }

    /// Attach a blob to the report, prefixed with the test name
    pub fn attach(&self, name: &str, content: &[u8], mime: &str) -> Result<()> {
        self.sink
            .attach(&format!("{} - {}", self.test_name, name), content, mime)
    }
}
