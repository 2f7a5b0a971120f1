//! Layered configuration
//!
//! Every value is looked up, highest priority first, in: the process
//! environment (exact key name), runtime overrides (`-D key=value`), the
//! persisted config file, and finally the built-in default. Resolved values
//! go through `${name}` placeholder expansion before they are returned.

pub mod expand;
pub mod file;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub use expand::expand_placeholders;

/// Key of the automation server URL, which has its own resolution branch
pub const SERVER_URL_KEY: &str = "appiumServerUrl";
/// Environment variable that overrides the server URL
pub const SERVER_URL_ENV: &str = "APPIUM_SERVER_URL";
/// Environment variable selecting `local` or `docker` mode
pub const ENV_MODE_VAR: &str = "ENV";

pub const APPIUM_URL_LOCAL: &str = "http://127.0.0.1:4723";
pub const APPIUM_URL_DOCKER: &str = "http://host.docker.internal:4723";

/// Application binary used when `appPath` is not configured
pub const DEFAULT_APP_PATH: &str = "bundle-to-test/android/app.apk";

const DEFAULT_CONFIG_FILE: &str = "config.properties";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config key '{key}' has invalid value '{value}' (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Read access to environment variables
pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Execution environment the server URL default is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvMode {
    Local,
    Docker,
}

impl EnvMode {
    pub fn default_server_url(self) -> &'static str {
        match self {
            EnvMode::Local => APPIUM_URL_LOCAL,
            EnvMode::Docker => APPIUM_URL_DOCKER,
        }
    }
}

/// Immutable, layered configuration. Built once and never mutated.
pub struct Config {
    overrides: HashMap<String, String>,
    file_props: HashMap<String, String>,
    env: Arc<dyn EnvSource>,
}

static GLOBAL: OnceLock<Arc<Config>> = OnceLock::new();

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Per-process configuration, built from the real environment on first access
    pub fn global() -> Arc<Config> {
        GLOBAL
            .get_or_init(|| Arc::new(Config::builder().build()))
            .clone()
    }

    /// Install the per-process configuration with runtime overrides.
    /// Has no effect if the configuration was already built.
    pub fn init_global(overrides: HashMap<String, String>) -> Arc<Config> {
        GLOBAL
            .get_or_init(|| Arc::new(Config::builder().overrides(overrides).build()))
            .clone()
    }

    /// Look up `key` through every layer, falling back to `default`
    pub fn get_or(&self, key: &str, default: &str) -> String {
        if key == SERVER_URL_KEY {
            return self.server_url();
        }
        let raw = self.lookup(key).unwrap_or_else(|| default.to_string());
        self.expand(&raw)
    }

    /// Like [`Config::get_or`] but without placeholder expansion
    pub fn get_raw_or(&self, key: &str, default: &str) -> String {
        self.lookup(key).unwrap_or_else(|| default.to_string())
    }

    /// Look up `key` without a default
    pub fn get(&self, key: &str) -> Option<String> {
        if key == SERVER_URL_KEY {
            return Some(self.server_url());
        }
        self.lookup(key).map(|raw| self.expand(&raw))
    }

    fn lookup(&self, key: &str) -> Option<String> {
        non_blank(self.env.var(key))
            .or_else(|| non_blank(self.overrides.get(key).cloned()))
            .or_else(|| non_blank(self.file_props.get(key).cloned()))
    }

    /// Expand `${name}` against overrides, then the environment
    pub fn expand(&self, input: &str) -> String {
        expand_placeholders(input, |name| {
            self.overrides
                .get(name)
                .cloned()
                .or_else(|| self.env.var(name))
        })
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        let value = self.get_or(key, &default.to_string());
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
                expected: "a non-negative integer",
            })
    }

    pub fn get_u32(&self, key: &str, default: u32) -> Result<u32> {
        let value = self.get_or(key, &default.to_string());
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
                expected: "a non-negative integer",
            })
    }

    pub fn get_u16(&self, key: &str, default: u16) -> Result<u16> {
        let value = self.get_or(key, &default.to_string());
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
                expected: "a port number",
            })
    }

    /// Lenient boolean: `true`, `yes`, `on` and `1` are true, anything else false
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        let value = self.get_or(key, &default.to_string());
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        )
    }

    pub fn get_secs(&self, key: &str, default: u64) -> Result<Duration> {
        self.get_u64(key, default).map(Duration::from_secs)
    }

    pub fn get_millis(&self, key: &str, default: u64) -> Result<Duration> {
        self.get_u64(key, default).map(Duration::from_millis)
    }

    /// Lowercased environment mode name (`local` unless set)
    pub fn env_name(&self) -> String {
        non_blank(self.overrides.get("env").cloned())
            .or_else(|| non_blank(self.env.var(ENV_MODE_VAR)))
            .or_else(|| non_blank(self.file_props.get("env").cloned()))
            .map(|v| v.trim().to_lowercase())
            .unwrap_or_else(|| "local".to_string())
    }

    pub fn env_mode(&self) -> EnvMode {
        if self.env_name() == "docker" {
            EnvMode::Docker
        } else {
            EnvMode::Local
        }
    }

    /// Explicit server URL, if one was provided by any layer
    pub fn explicit_server_url(&self) -> Option<String> {
        non_blank(self.env.var(SERVER_URL_ENV))
            .or_else(|| self.lookup(SERVER_URL_KEY))
            .map(|raw| normalize_url(&self.expand(&raw)))
    }

    /// Server URL given through the environment or a runtime override.
    /// The file layer is not consulted.
    pub fn server_url_override(&self) -> Option<String> {
        non_blank(self.env.var(SERVER_URL_ENV))
            .or_else(|| non_blank(self.env.var(SERVER_URL_KEY)))
            .or_else(|| non_blank(self.overrides.get(SERVER_URL_KEY).cloned()))
            .map(|raw| normalize_url(&self.expand(&raw)))
    }

    /// True when the server URL comes from the `APPIUM_SERVER_URL` variable
    pub fn server_url_from_env(&self) -> bool {
        non_blank(self.env.var(SERVER_URL_ENV)).is_some()
    }

    /// Automation server URL without a trailing slash
    pub fn server_url(&self) -> String {
        self.explicit_server_url()
            .unwrap_or_else(|| self.env_mode().default_server_url().to_string())
    }

    pub fn env_var(&self, name: &str) -> Option<String> {
        non_blank(self.env.var(name))
    }

    pub fn platform(&self) -> String {
        self.get_or("platform", "Android")
    }

    pub fn udid(&self) -> String {
        self.get_or("udid", "ef7a8b61")
    }

    pub fn device_name(&self) -> String {
        self.get_or("deviceName", "RMX1901")
    }

    pub fn app_path(&self) -> String {
        self.get_or("appPath", DEFAULT_APP_PATH)
    }

    pub fn app_package(&self) -> String {
        self.get_or("appPackage", "")
    }

    pub fn app_activity(&self) -> String {
        self.get_or("appActivity", "")
    }

    pub fn bundle_id(&self) -> String {
        self.get_or("bundleId", "com.example.ios.app")
    }

    pub fn start_local_server(&self) -> bool {
        self.get_bool("appium.local", false)
    }

    pub fn server_host(&self) -> String {
        self.get_or("appium.host", "127.0.0.1")
    }

    pub fn server_port(&self) -> Result<u16> {
        self.get_u16("appium.port", 4723)
    }

    pub fn node_path(&self) -> String {
        self.get_or("appium.node", "")
    }

    pub fn appium_js_path(&self) -> String {
        self.get_or("appium.js", "")
    }

    /// Required server major version; `0` accepts any
    pub fn required_major_version(&self) -> Result<u32> {
        self.get_u32("appium.major.version", 2)
    }

    pub fn server_start_timeout(&self) -> Result<Duration> {
        self.get_secs("appium.start.timeout.seconds", 30)
    }

    pub fn fallback_enabled(&self) -> bool {
        self.get_bool("appium.fallback.enabled", true)
    }

    pub fn reports_dir(&self) -> PathBuf {
        PathBuf::from(self.get_or("reports.dir", "reports"))
    }

    pub fn server_log_file(&self) -> PathBuf {
        let default = self.reports_dir().join("appium.log");
        PathBuf::from(self.get_or("appium.log", &default.to_string_lossy()))
    }

    pub fn retry_count(&self) -> Result<u32> {
        self.get_u32("retry.count", 1)
    }

    pub fn retry_delay(&self) -> Result<Duration> {
        self.get_millis("retry.delay.ms", 1000)
    }

    pub fn explicit_wait(&self) -> Result<Duration> {
        self.get_secs("wait.seconds", 10)
    }

    pub fn implicit_wait(&self) -> Result<Duration> {
        self.get_secs("implicit.wait.seconds", 0)
    }

    pub fn new_command_timeout(&self) -> Result<Duration> {
        self.get_secs("newCommandTimeout.seconds", 300)
    }

    pub fn thread_count(&self) -> Result<usize> {
        self.get_u32("thread.count", 1).map(|n| n.max(1) as usize)
    }

    pub fn execution_mode(&self) -> String {
        self.get_or("execution.mode", "auto")
    }

    /// Multi-line configuration banner
    pub fn summary(&self) -> String {
        let rows = [
            ("Environment", self.env_name().to_uppercase()),
            ("Appium Server", self.server_url()),
            ("Platform", self.platform()),
            (
                "Device",
                format!("{} ({})", self.device_name(), self.udid()),
            ),
            ("Local Start", self.start_local_server().to_string()),
            ("Execution", self.execution_mode()),
            (
                "Waits",
                format!(
                    "explicit {}, implicit {}",
                    secs_or_error(self.explicit_wait()),
                    secs_or_error(self.implicit_wait())
                ),
            ),
        ];

        let mut out = String::from("Test configuration\n");
        for (label, value) in rows {
            out.push_str(&format!("  {:<14}: {}\n", label, value));
        }
        out
    }
}

fn secs_or_error(value: Result<Duration>) -> String {
    match value {
        Ok(d) => format!("{}s", d.as_secs()),
        Err(e) => e.to_string(),
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Builder for isolated configurations (tests, embedded runners)
#[derive(Default)]
pub struct ConfigBuilder {
    overrides: HashMap<String, String>,
    env: Option<Arc<dyn EnvSource>>,
    file: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.overrides.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env(mut self, env: impl EnvSource + 'static) -> Self {
        self.env = Some(Arc::new(env));
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Never fails: an absent or unreadable file leaves only the other layers
    pub fn build(self) -> Config {
        let env = self.env.unwrap_or_else(|| Arc::new(ProcessEnv));
        let path = self
            .file
            .or_else(|| non_blank(self.overrides.get("config.file").cloned()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let file_props = file::load_properties_file(&path);
        if !file_props.is_empty() {
            log::debug!("Loaded {} config entries from {}", file_props.len(), path.display());
        }

        Config {
            overrides: self.overrides,
            file_props,
            env,
        }
    }
}

/// Parse `key=value` override pairs (as given with `-D`)
pub fn parse_overrides<'a, I>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a String>,
{
    pairs
        .into_iter()
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
