//! Driver sessions: one live automation session per execution lane

pub mod capabilities;
pub mod manager;
pub mod remote;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use capabilities::Capabilities;
pub use manager::{DriverSession, DriverSessionManager, ReachabilityPolicy, SessionContext};
pub use remote::{RemoteSession, SessionFactory, WebDriverFactory};

/// Target platform of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "Android",
            Platform::Ios => "iOS",
        }
    }

    /// What to check when the server cannot be reached for this platform
    pub fn troubleshooting_hint(&self) -> &'static str {
        match self {
            Platform::Android => {
                "Check that the device is listed by `adb devices` and that the UiAutomator2 \
                 driver is installed (`appium driver install uiautomator2`)."
            }
            Platform::Ios => {
                "Check that the XCUITest driver is installed (`appium driver install xcuitest`) \
                 and that WebDriverAgent can be built for the device."
            }
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_matches('"').to_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            _ => Err(SessionError::UnknownPlatform(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown platform '{0}' (expected Android or iOS)")]
    UnknownPlatform(String),

    #[error("Cannot reach Appium server at '{url}'. {hint}{}", last_error_suffix(.last_error))]
    Unreachable {
        url: String,
        hint: String,
        last_error: Option<String>,
    },

    #[error("App not found at '{}' (also tried '{}'). Set appPath if required.", .primary.display(), .fallback.display())]
    AppNotFound { primary: PathBuf, fallback: PathBuf },

    #[error("Failed to create {platform} session at {endpoint}: {reason}")]
    Create {
        platform: Platform,
        endpoint: String,
        reason: String,
    },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

fn last_error_suffix(last: &Option<String>) -> String {
    match last {
        Some(e) => format!(" Last error: {}", e),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        assert_eq!("Android".parse::<Platform>().unwrap(), Platform::Android);
        assert_eq!("iOS".parse::<Platform>().unwrap(), Platform::Ios);
        assert_eq!("\"ios\"".parse::<Platform>().unwrap(), Platform::Ios);
        assert!(matches!(
            "web".parse::<Platform>(),
            Err(SessionError::UnknownPlatform(_))
        ));
    }

    #[test]
    fn test_unreachable_message() {
        let err = SessionError::Unreachable {
            url: "http://h:4723/status".to_string(),
            hint: Platform::Ios.troubleshooting_hint().to_string(),
            last_error: Some("connection refused".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("http://h:4723/status"));
        assert!(msg.contains("xcuitest"));
        assert!(msg.ends_with("Last error: connection refused"));
    }
}
