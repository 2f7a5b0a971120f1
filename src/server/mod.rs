//! Local Appium server lifecycle: start, version gate, stop

pub mod launcher;
pub mod manager;
pub mod status;

use std::path::PathBuf;

pub use launcher::{LaunchSpec, OsLauncher, ProcessLauncher, ServerProcess};
pub use manager::{is_loopback_url, ServerLifecycleManager, ServerState, ServerTimings};
pub use status::{extract_major_version, HttpStatusClient, StatusClient, StatusReply};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(
        "Local Appium start is enabled (appium.local=true) but the Appium service could not be \
         started (missing/invalid appium.node/appium.js) and fallback is disabled \
         (appium.fallback.enabled=false). Either provide appium.node/appium.js or disable \
         appium.local and point appiumServerUrl/APPIUM_SERVER_URL at an external Appium server."
    )]
    NoStartPath,

    #[error("Failed to start Appium with '{command}': {reason}. {hint}")]
    Spawn {
        command: String,
        hint: String,
        reason: String,
    },

    #[error("Appium process terminated immediately{}", log_hint(.log_file))]
    ExitedEarly { log_file: Option<PathBuf> },

    #[error("Port {port} is in use and no free port was found in {start}..={end}")]
    NoFreePort { port: u16, start: u16, end: u16 },

    #[error("Appium at {url} reports major version {found}, but {required} is required (appium.major.version)")]
    VersionMismatch { url: String, found: u32, required: u32 },

    #[error(
        "Timed out after {}s waiting for Appium at {url}. If the server runs on another host, \
         start it with --address 0.0.0.0 and make sure the firewall allows the port.",
        .timeout.as_secs()
    )]
    StartTimeout {
        url: String,
        timeout: std::time::Duration,
    },
}

fn log_hint(log_file: &Option<PathBuf>) -> String {
    match log_file {
        Some(path) => format!(". See logs: {}", path.display()),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
