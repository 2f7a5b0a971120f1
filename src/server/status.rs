//! Automation server `/status` probing
//!
//! Appium 2.x answers `{"build":{"version":"2.4.1"}}`, 1.x nests the same
//! under `value`. Both shapes are accepted.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Raw answer of one `GET /status`
#[derive(Debug, Clone)]
pub struct StatusReply {
    pub code: u16,
    pub body: String,
}

impl StatusReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// A 4xx still proves a server process is answering on that address
    pub fn is_reachable(&self) -> bool {
        (200..500).contains(&self.code)
    }
}

/// Fetches a status URL. Errors are transport errors (refused, timeout...)
pub trait StatusClient: Send + Sync {
    fn get(&self, url: &str) -> Result<StatusReply>;
}

/// Blocking HTTP client with short per-request timeouts
pub struct HttpStatusClient {
    client: reqwest::blocking::Client,
}

impl HttpStatusClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(2))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl StatusClient for HttpStatusClient {
    fn get(&self, url: &str) -> Result<StatusReply> {
        let resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("GET {} failed", url))?;
        let code = resp.status().as_u16();
        let body = resp.text().unwrap_or_default();
        Ok(StatusReply { code, body })
    }
}

#[derive(Debug, Deserialize)]
struct Build {
    version: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StatusValue {
    build: Option<Build>,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    build: Option<Build>,
    value: Option<StatusValue>,
}

/// Major version from a `/status` body, `None` if the body has no usable version
pub fn extract_major_version(body: &str) -> Option<u32> {
    let status: StatusBody = serde_json::from_str(body).ok()?;

    let flat = status.build.and_then(|b| b.version);
    let nested = status.value.and_then(|v| v.build).and_then(|b| b.version);

    [flat, nested]
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().and_then(major_component))
}

fn major_component(version: &str) -> Option<u32> {
    version.trim().split('.').next()?.parse().ok()
}

/// `required == 0` accepts any major version
pub fn is_compatible(found: u32, required: u32) -> bool {
    required == 0 || found == required
}

/// Join a base URL and the status path
pub fn status_url(base: &str) -> String {
    format!("{}/status", base.trim_end_matches('/'))
}

/// How the version poll ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionProbe {
    Compatible(u32),
    Mismatch(u32),
    TimedOut,
}

/// Poll `url` every `interval` until a version parses or `timeout` passes.
///
/// Failed polls (transport errors, non-2xx, unparsable bodies) count as
/// "not ready yet" and are retried.
pub fn poll_major_version(
    client: &dyn StatusClient,
    url: &str,
    required: u32,
    timeout: Duration,
    interval: Duration,
) -> VersionProbe {
    let deadline = Instant::now() + timeout;

    loop {
        match client.get(url) {
            Ok(reply) if reply.is_success() => {
                if let Some(major) = extract_major_version(&reply.body) {
                    log::info!("Detected Appium major version {} at {}", major, url);
                    return if is_compatible(major, required) {
                        VersionProbe::Compatible(major)
                    } else {
                        log::warn!(
                            "Appium major version {} at {} does not match required {}",
                            major,
                            url,
                            required
                        );
                        VersionProbe::Mismatch(major)
                    };
                }
                log::debug!("No version in /status body yet: {}", reply.body);
            }
            Ok(reply) => log::debug!("{} answered HTTP {}", url, reply.code),
            Err(e) => log::debug!("Status poll failed: {:#}", e),
        }

        let now = Instant::now();
        if now >= deadline {
            log::warn!("Timed out waiting for /status at {}", url);
            return VersionProbe::TimedOut;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}
