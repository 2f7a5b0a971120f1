use super::types::{AttachmentEntry, TestResultEntry, TestResults, TestStatus};
use super::ReportSink;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const RESULTS_FILE: &str = "results.json";

struct JsonState {
    results: TestResults,
    retries: HashMap<String, u32>,
}

/// Collects results in memory and writes `results.json` into the reports
/// directory. Attachments are written straight away under `attachments/`.
pub struct JsonReportSink {
    dir: PathBuf,
    state: Mutex<JsonState>,
}

impl JsonReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(JsonState {
                results: TestResults::new(uuid::Uuid::new_v4().to_string()),
                retries: HashMap::new(),
            }),
        }
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    /// Snapshot of everything recorded so far
    pub fn results(&self) -> TestResults {
        self.lock().results.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JsonState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ReportSink for JsonReportSink {
    fn attach(&self, name: &str, content: &[u8], mime: &str) -> Result<()> {
        let attachments = self.dir.join("attachments");
        std::fs::create_dir_all(&attachments)
            .with_context(|| format!("Failed to create {}", attachments.display()))?;

        let mut state = self.lock();
        let file_name = format!(
            "{:03}-{}.{}",
            state.results.attachments.len() + 1,
            sanitize(name),
            extension_for(mime)
        );
        let path = attachments.join(&file_name);
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write attachment {}", path.display()))?;

        state.results.attachments.push(AttachmentEntry {
            name: name.to_string(),
            mime: mime.to_string(),
            path: format!("attachments/{}", file_name),
        });
        Ok(())
    }

    fn record_result(
        &self,
        name: &str,
        status: TestStatus,
        duration_ms: u64,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock();
        let retries = state.retries.remove(name).unwrap_or(0);
        state.results.push(TestResultEntry {
            name: name.to_string(),
            status,
            duration_ms,
            error: error.map(str::to_string),
            retries,
            finished_at: chrono::Local::now().to_rfc3339(),
        });
        Ok(())
    }

    fn record_retry(&self, name: &str, attempt: u32) {
        self.lock().retries.insert(name.to_string(), attempt);
    }

    fn finish(&self) -> Result<()> {
        let mut state = self.lock();
        state.results.generated_at = chrono::Local::now().to_rfc3339();
        write(&state.results, &self.results_path())
    }
}

/// Write `results` as pretty JSON, creating the parent directory
pub fn write(results: &TestResults, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("JSON report saved to: {}", path.display());
    Ok(())
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "text/plain" => "txt",
        "application/json" => "json",
        "text/html" => "html",
        "video/mp4" => "mp4",
        _ => "bin",
    }
}
