use super::launcher::{
    find_free_port, is_port_free, spawn_hint, LaunchSpec, OsLauncher, ProcessLauncher,
    ServerProcess, PORT_SEARCH_WINDOW,
};
use super::status::{
    extract_major_version, is_compatible, poll_major_version, status_url, HttpStatusClient,
    StatusClient, VersionProbe,
};
use super::{Result, ServerError};
use crate::config::Config;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Lifecycle of the managed automation server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Running {
        host: String,
        port: u16,
        version: u32,
    },
    StopRequested,
    Stopped,
}

/// Waits used while starting and stopping
#[derive(Debug, Clone, Copy)]
pub struct ServerTimings {
    /// Pause after spawning before the first liveness check
    pub grace: Duration,
    pub poll_interval: Duration,
    /// Graceful shutdown window before a forced kill
    pub stop_timeout: Duration,
}

impl Default for ServerTimings {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(2500),
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

struct Inner {
    state: ServerState,
    /// Preferred in-process start (explicit node + appium.js)
    service: Option<Box<dyn ServerProcess>>,
    /// Fallback npx process
    external: Option<Box<dyn ServerProcess>>,
}

/// Settings read from [`Config`] at the start of `ensure_started`
struct StartPlan {
    host: String,
    port: u16,
    required_major: u32,
    timeout: Duration,
    node: String,
    appium_js: String,
    fallback: bool,
    log_file: PathBuf,
}

/// Owns the locally started automation server, if any.
///
/// One instance per suite, passed through setup and teardown. Both
/// operations take the same lock, so concurrent or repeated calls neither
/// double-start nor double-stop.
pub struct ServerLifecycleManager {
    config: Arc<Config>,
    launcher: Arc<dyn ProcessLauncher>,
    status: Arc<dyn StatusClient>,
    timings: ServerTimings,
    inner: Mutex<Inner>,
}

impl ServerLifecycleManager {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        Ok(Self::with_parts(
            config,
            Arc::new(OsLauncher),
            Arc::new(HttpStatusClient::new()?),
            ServerTimings::default(),
        ))
    }

    pub fn with_parts(
        config: Arc<Config>,
        launcher: Arc<dyn ProcessLauncher>,
        status: Arc<dyn StatusClient>,
        timings: ServerTimings,
    ) -> Self {
        Self {
            config,
            launcher,
            status,
            timings,
            inner: Mutex::new(Inner {
                state: ServerState::NotStarted,
                service: None,
                external: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ServerState {
        self.lock().state.clone()
    }

    /// Base URL of the managed or reused server
    pub fn endpoint(&self) -> Option<String> {
        match &self.lock().state {
            ServerState::Running { host, port, .. } => Some(format!("http://{}:{}", host, port)),
            _ => None,
        }
    }

    /// Make sure a reachable server exists before sessions are created
    pub fn ensure_started(&self) -> Result<()> {
        let mut inner = self.lock();

        if !self.config.start_local_server() {
            log::info!("appium.local=false; expecting an externally provided Appium server");
            return Ok(());
        }

        if let Some(url) = self.config.server_url_override() {
            if !is_loopback_url(&url) {
                log::info!("Appium URL '{}' points to an external host; not starting a local server", url);
                return Ok(());
            }
        }

        if inner.service.as_mut().map_or(false, |p| p.is_alive())
            || inner.external.as_mut().map_or(false, |p| p.is_alive())
        {
            log::debug!("Managed Appium server already running");
            return Ok(());
        }
        if inner.service.is_none()
            && inner.external.is_none()
            && matches!(inner.state, ServerState::Running { .. })
        {
            log::debug!("Reusing compatible Appium server found earlier");
            return Ok(());
        }

        let plan = self.plan()?;
        inner.state = ServerState::Starting;
        inner.service = None;
        inner.external = None;

        let result = self.start(&mut inner, &plan);
        if result.is_err() {
            inner.state = ServerState::NotStarted;
        }
        result
    }

    fn plan(&self) -> Result<StartPlan> {
        let cfg = &self.config;
        Ok(StartPlan {
            host: cfg.server_host(),
            port: cfg.server_port()?,
            required_major: cfg.required_major_version()?,
            timeout: cfg.server_start_timeout()?,
            node: cfg.node_path(),
            appium_js: cfg.appium_js_path(),
            fallback: cfg.fallback_enabled(),
            log_file: cfg.server_log_file(),
        })
    }

    fn start(&self, inner: &mut Inner, plan: &StartPlan) -> Result<()> {
        let have_service_paths = !plan.node.trim().is_empty() && !plan.appium_js.trim().is_empty();

        if have_service_paths {
            match self.start_service(plan) {
                Ok((process, version)) => {
                    inner.service = Some(process);
                    inner.state = ServerState::Running {
                        host: plan.host.clone(),
                        port: plan.port,
                        version,
                    };
                    return Ok(());
                }
                Err(e) => log::warn!("Failed to start Appium service: {}", e),
            }
        } else {
            log::info!("appium.local=true but appium.node/appium.js not provided");
        }

        if !plan.fallback {
            return Err(ServerError::NoStartPath);
        }

        self.start_external(inner, plan)
    }

    /// Preferred path. On any failure the process is torn down again.
    fn start_service(&self, plan: &StartPlan) -> Result<(Box<dyn ServerProcess>, u32)> {
        let spec = LaunchSpec::service(&plan.node, &plan.appium_js, &plan.host, plan.port);
        let mut process = self
            .launcher
            .spawn(&spec)
            .map_err(|e| ServerError::Spawn {
                command: spec.display(),
                hint: "Check appium.node and appium.js".to_string(),
                reason: format!("{:#}", e),
            })?;

        if !process.is_alive() {
            return Err(ServerError::ExitedEarly {
                log_file: None,
            });
        }
        log::info!(
            "Started Appium service on {}:{} (pid {})",
            plan.host,
            plan.port,
            process.id()
        );

        match self.validate(plan, plan.port) {
            Ok(version) => Ok((process, version)),
            Err(e) => {
                if let Err(stop_err) = process.terminate() {
                    log::warn!("Ignoring error while stopping Appium service: {:#}", stop_err);
                }
                Err(e)
            }
        }
    }

    fn start_external(&self, inner: &mut Inner, plan: &StartPlan) -> Result<()> {
        let mut port = plan.port;

        if !is_port_free(&plan.host, port) {
            let running = self
                .status
                .get(&status_url(&format!("http://{}:{}", plan.host, port)))
                .ok()
                .filter(|r| r.is_success())
                .and_then(|r| extract_major_version(&r.body));

            if let Some(major) = running.filter(|m| is_compatible(*m, plan.required_major)) {
                log::info!(
                    "Found compatible Appium server on {}:{} (major={}); reusing it",
                    plan.host,
                    port,
                    major
                );
                inner.state = ServerState::Running {
                    host: plan.host.clone(),
                    port,
                    version: major,
                };
                return Ok(());
            }

            let start = port.saturating_add(1);
            let end = port.saturating_add(PORT_SEARCH_WINDOW);
            let free = find_free_port(&plan.host, start, end).ok_or(ServerError::NoFreePort {
                port,
                start,
                end,
            })?;
            log::info!(
                "Port {} is in use (running major={:?}); using free port {}",
                port,
                running,
                free
            );
            port = free;
        }

        let spec = LaunchSpec::npx(plan.required_major, &plan.host, port, &plan.log_file);
        let mut process = self.launcher.spawn(&spec).map_err(|e| ServerError::Spawn {
            command: spec.display(),
            hint: spawn_hint(&e).to_string(),
            reason: format!("{:#}", e),
        })?;

        std::thread::sleep(self.timings.grace);

        if !process.is_alive() {
            return Err(ServerError::ExitedEarly {
                log_file: Some(plan.log_file.clone()),
            });
        }
        log::info!(
            "Started external Appium process on {}:{}; logs: {}",
            plan.host,
            port,
            plan.log_file.display()
        );

        match self.validate(plan, port) {
            Ok(version) => {
                inner.external = Some(process);
                inner.state = ServerState::Running {
                    host: plan.host.clone(),
                    port,
                    version,
                };
                Ok(())
            }
            Err(e) => {
                if let Err(kill_err) = process.kill() {
                    log::warn!("Ignoring error while killing Appium process: {:#}", kill_err);
                }
                Err(e)
            }
        }
    }

    fn validate(&self, plan: &StartPlan, port: u16) -> Result<u32> {
        let url = status_url(&format!("http://{}:{}", plan.host, port));
        match poll_major_version(
            self.status.as_ref(),
            &url,
            plan.required_major,
            plan.timeout,
            self.timings.poll_interval,
        ) {
            VersionProbe::Compatible(major) => Ok(major),
            VersionProbe::Mismatch(found) => Err(ServerError::VersionMismatch {
                url,
                found,
                required: plan.required_major,
            }),
            VersionProbe::TimedOut => Err(ServerError::StartTimeout {
                url,
                timeout: plan.timeout,
            }),
        }
    }

    /// Stop whatever this manager started. Safe to call at any time, any number of times.
    pub fn shutdown(&self) {
        let mut inner = self.lock();

        let owns_something = inner.service.is_some() || inner.external.is_some();
        if !owns_something && !matches!(inner.state, ServerState::Running { .. }) {
            return;
        }
        inner.state = ServerState::StopRequested;

        if let Some(mut service) = inner.service.take() {
            if service.is_alive() {
                if let Err(e) = service.terminate() {
                    log::warn!("Ignoring error while stopping Appium service: {:#}", e);
                }
            }
        }

        if let Some(mut process) = inner.external.take() {
            let stopped = process
                .terminate()
                .and_then(|_| process.wait_timeout(self.timings.stop_timeout));
            match stopped {
                Ok(true) => log::info!("Appium process {} stopped", process.id()),
                Ok(false) => {
                    log::warn!("Appium process {} did not exit in time; killing", process.id());
                    if let Err(e) = process.kill() {
                        log::warn!("Ignoring error while killing Appium process: {:#}", e);
                    }
                }
                Err(e) => {
                    log::warn!("Graceful Appium stop failed: {:#}; killing", e);
                    if let Err(e) = process.kill() {
                        log::warn!("Ignoring error while killing Appium process: {:#}", e);
                    }
                }
            }
        }

        inner.state = ServerState::Stopped;
    }
}

/// Loopback check on the host part of a URL
pub fn is_loopback_url(url: &str) -> bool {
    let lower = url.trim().to_lowercase();
    let without_scheme = lower.split("://").nth(1).unwrap_or(&lower);
    let authority = without_scheme.split('/').next().unwrap_or("");
    let host = if let Some(rest) = authority.strip_prefix('[') {
        rest.split(']').next().unwrap_or("")
    } else {
        authority.rsplit_once(':').map_or(authority, |(h, _)| h)
    };

    host == "localhost"
        || host == "::1"
        || host
            .parse::<std::net::Ipv4Addr>()
            .map_or(false, |ip| ip.is_loopback())
}
