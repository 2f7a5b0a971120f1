use serde::{Deserialize, Serialize};

/// Final status of a test, after retries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
        }
    }
}

/// One reported test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultEntry {
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retries: u32,
    pub finished_at: String,
}

/// A file written next to the results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentEntry {
    pub name: String,
    pub mime: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Contents of `results.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub run_id: String,
    pub results: Vec<TestResultEntry>,
    pub attachments: Vec<AttachmentEntry>,
    pub summary: ReportSummary,
    pub generated_at: String,
}

impl TestResults {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            results: Vec::new(),
            attachments: Vec::new(),
            summary: ReportSummary::default(),
            generated_at: String::new(),
        }
    }

    pub fn push(&mut self, entry: TestResultEntry) {
        self.summary.total += 1;
        match entry.status {
            TestStatus::Passed => self.summary.passed += 1,
            TestStatus::Failed => self.summary.failed += 1,
            TestStatus::Skipped => self.summary.skipped += 1,
        }
        self.results.push(entry);
    }
}
