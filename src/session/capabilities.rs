//! Capability sets for Android (UiAutomator2) and iOS (XCUITest) sessions

use super::{Platform, Result, SessionError};
use crate::config::Config;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// W3C capabilities that are sent without the `appium:` vendor prefix
const STANDARD_CAPABILITIES: &[&str] = &[
    "platformName",
    "browserName",
    "browserVersion",
    "acceptInsecureCerts",
    "pageLoadStrategy",
    "proxy",
    "setWindowRect",
    "timeouts",
    "unhandledPromptBehavior",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    /// Set `name` only when `value` is not blank
    pub fn set_non_blank(&mut self, name: &str, value: &str) -> &mut Self {
        if !value.trim().is_empty() {
            self.set(name, value);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Vendor-prefixed map as sent in a W3C new-session request
    pub fn to_w3c(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(k, v)| {
                let key = if STANDARD_CAPABILITIES.contains(&k.as_str()) || k.contains(':') {
                    k.clone()
                } else {
                    format!("appium:{}", k)
                };
                (key, v.clone())
            })
            .collect()
    }
}

/// Where relative app paths are resolved from
#[derive(Debug, Clone)]
pub struct PathContext {
    pub cwd: PathBuf,
    /// Host-side checkout when tests run in a container (`HOST_WORKSPACE`)
    pub host_workspace: Option<PathBuf>,
}

impl PathContext {
    pub fn from_config(config: &Config, cwd: PathBuf) -> Self {
        Self {
            cwd,
            host_workspace: config.env_var("HOST_WORKSPACE").map(PathBuf::from),
        }
    }
}

pub fn build(platform: Platform, config: &Config, paths: &PathContext) -> Result<Capabilities> {
    match platform {
        Platform::Android => android(config, paths),
        Platform::Ios => ios(config),
    }
}

pub fn android(config: &Config, paths: &PathContext) -> Result<Capabilities> {
    let package = config.app_package();
    let activity = config.app_activity();

    let mut caps = Capabilities::new();
    caps.set("platformName", "Android")
        .set("automationName", "UiAutomator2")
        .set("deviceName", config.device_name())
        .set("udid", config.udid())
        .set("newCommandTimeout", config.new_command_timeout()?.as_secs())
        .set("autoGrantPermissions", true)
        .set("app", resolve_app_path(config, paths)?)
        .set_non_blank("appPackage", &package)
        .set_non_blank("appActivity", &activity)
        .set("adbExecTimeout", 600_000)
        .set_non_blank("appWaitActivity", &activity)
        .set_non_blank("appWaitPackage", &package)
        .set("appWaitDuration", 30_000);
    Ok(caps)
}

pub fn ios(config: &Config) -> Result<Capabilities> {
    let mut caps = Capabilities::new();
    caps.set("platformName", "iOS")
        .set("automationName", "XCUITest")
        .set("deviceName", config.device_name())
        .set("bundleId", config.bundle_id())
        .set("newCommandTimeout", config.new_command_timeout()?.as_secs());
    Ok(caps)
}

/// Resolve `appPath` to the path sent to the server.
///
/// With a host workspace the path is rebased onto it and not checked: the
/// file lives on the server's filesystem. Otherwise the expanded value is
/// tried first; if it does not exist, `${user.dir}` is replaced by the
/// working directory, other placeholders are stripped and that path is tried.
pub fn resolve_app_path(config: &Config, paths: &PathContext) -> Result<String> {
    let raw = config.get_raw_or("appPath", crate::config::DEFAULT_APP_PATH);
    log::debug!("appPath from config: '{}'", raw);

    if let Some(workspace) = &paths.host_workspace {
        let apk = workspace.join(normalize_separators(&relative_to_workspace(&raw)));
        if !apk.exists() {
            log::warn!(
                "App not visible locally at '{}'; sending the host path to the server as is",
                apk.display()
            );
        }
        return Ok(apk.to_string_lossy().to_string());
    }

    let expanded = expand_home(&config.expand(&raw));
    let primary = absolutize(&normalize_separators(&expanded), &paths.cwd);
    if primary.exists() {
        log::info!("Resolved app path: {}", primary.display());
        return Ok(primary.to_string_lossy().to_string());
    }

    let cleaned = clean_placeholders(&raw, &paths.cwd);
    let fallback = absolutize(&normalize_separators(&expand_home(&cleaned)), &paths.cwd);
    log::info!(
        "App not found at '{}'; trying '{}'",
        primary.display(),
        fallback.display()
    );
    if fallback.exists() {
        return Ok(fallback.to_string_lossy().to_string());
    }

    Err(SessionError::AppNotFound { primary, fallback })
}

fn relative_to_workspace(raw: &str) -> String {
    if let Some(idx) = raw.find("bundle-to-test") {
        return raw[idx..].to_string();
    }
    raw.strip_prefix("/workspace/")
        .or_else(|| raw.strip_prefix('/'))
        .unwrap_or(raw)
        .to_string()
}

fn clean_placeholders(raw: &str, cwd: &Path) -> String {
    let with_cwd = raw.replace("${user.dir}", &cwd.to_string_lossy());
    match Regex::new(r"\$\{[^}]+\}") {
        Ok(re) => re.replace_all(&with_cwd, "").to_string(),
        Err(_) => with_cwd,
    }
}

fn expand_home(path: &str) -> String {
    let Some(home) = dirs::home_dir() else {
        return path.to_string();
    };
    let home = home.to_string_lossy();
    let replaced = path
        .replace("%USERPROFILE%", &home)
        .replace("%userprofile%", &home);
    match replaced.strip_prefix("~/") {
        Some(rest) => format!("{}/{}", home, rest),
        None => replaced,
    }
}

fn normalize_separators(path: &str) -> String {
    path.chars()
        .map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
        .collect()
}

fn absolutize(path: &str, cwd: &Path) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        cwd.join(p)
    }
}
