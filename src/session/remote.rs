//! W3C WebDriver new-session / delete-session against the automation server

use super::capabilities::Capabilities;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// One remote automation session
pub trait RemoteSession: Send {
    fn id(&self) -> &str;
    /// End the session on the server
    fn quit(&mut self) -> Result<()>;
}

/// Opens remote sessions
pub trait SessionFactory: Send + Sync {
    fn create(&self, endpoint: &str, capabilities: &Capabilities) -> Result<Box<dyn RemoteSession>>;
}

#[derive(Debug, Deserialize)]
struct NewSessionValue {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewSessionResponse {
    value: Option<NewSessionValue>,
    /// Legacy JSONWP responses carry the id at top level
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Blocking HTTP implementation of [`SessionFactory`]
pub struct WebDriverFactory {
    client: reqwest::blocking::Client,
}

impl WebDriverFactory {
    pub fn new() -> Result<Self> {
        // new-session may install the app first, so allow for a slow answer
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

impl SessionFactory for WebDriverFactory {
    fn create(&self, endpoint: &str, capabilities: &Capabilities) -> Result<Box<dyn RemoteSession>> {
        let url = format!("{}/session", endpoint);
        let body = serde_json::json!({
            "capabilities": {
                "alwaysMatch": capabilities.to_w3c(),
                "firstMatch": [{}],
            }
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .with_context(|| format!("Failed to create session at {}", url))?;
        let code = resp.status();

        let parsed: NewSessionResponse = resp
            .json()
            .context("Failed to parse session response")?;

        let value = parsed.value;
        let session_id = parsed
            .session_id
            .or_else(|| value.as_ref().and_then(|v| v.session_id.clone()));

        match session_id {
            Some(id) if code.is_success() => Ok(Box::new(WebDriverSession {
                client: self.client.clone(),
                endpoint: endpoint.to_string(),
                id,
            })),
            _ => {
                let (error, message) = value
                    .map(|v| (v.error, v.message))
                    .unwrap_or((None, None));
                anyhow::bail!(
                    "Server refused new session (HTTP {}): {}: {}",
                    code.as_u16(),
                    error.unwrap_or_else(|| "unknown error".to_string()),
                    message.unwrap_or_default()
                )
            }
        }
    }
}

pub struct WebDriverSession {
    client: reqwest::blocking::Client,
    endpoint: String,
    id: String,
}

impl RemoteSession for WebDriverSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn quit(&mut self) -> Result<()> {
        let url = format!("{}/session/{}", self.endpoint, self.id);
        let resp = self
            .client
            .delete(&url)
            .timeout(Duration::from_secs(60))
            .send()
            .with_context(|| format!("Failed to delete session {}", self.id))?;
        if !resp.status().is_success() {
            anyhow::bail!("Delete session {} returned HTTP {}", self.id, resp.status());
        }
        Ok(())
    }
}
