use super::types::TestStatus;
use super::ReportSink;
use anyhow::Result;
use colored::Colorize;

/// One colored line per result on stdout
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ReportSink for ConsoleSink {
    fn attach(&self, name: &str, content: &[u8], mime: &str) -> Result<()> {
        log::debug!("Attachment '{}' ({}, {} bytes)", name, mime, content.len());
        Ok(())
    }

    fn record_result(
        &self,
        name: &str,
        status: TestStatus,
        duration_ms: u64,
        error: Option<&str>,
    ) -> Result<()> {
        let secs = format!("({:.1}s)", duration_ms as f64 / 1000.0).dimmed();
        match status {
            TestStatus::Passed => println!("  {} {} {}", "✓".green(), name, secs),
            TestStatus::Skipped => println!("  {} {} {}", "○".yellow(), name.dimmed(), secs),
            TestStatus::Failed => {
                println!("  {} {} {}", "✗".red(), name.red(), secs);
                if let Some(error) = error {
                    println!("      {}", error.red().dimmed());
                }
            }
        }
        Ok(())
    }

    fn record_retry(&self, name: &str, attempt: u32) {
        println!("  {} {} {}", "↻".yellow(), name, format!("retry {}", attempt).yellow());
    }
}
