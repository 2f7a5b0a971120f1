//! Spawning and stopping automation server processes

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// How many ports above the configured one are probed on conflict
pub const PORT_SEARCH_WINDOW: u16 = 50;

/// Command line for one server process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// stdout and stderr are appended here; discarded when `None`
    pub log_file: Option<PathBuf>,
}

impl LaunchSpec {
    /// Preferred start: `node <appium.js> --address <host> --port <port>`
    pub fn service(node: &str, appium_js: &str, host: &str, port: u16) -> Self {
        Self {
            program: PathBuf::from(node),
            args: vec![
                appium_js.to_string(),
                "--address".to_string(),
                host.to_string(),
                "--port".to_string(),
                port.to_string(),
            ],
            log_file: None,
        }
    }

    /// Fallback start through npx, pinned to `appium@<major>` unless `major == 0`
    pub fn npx(required_major: u32, host: &str, port: u16, log_file: &Path) -> Self {
        let npx = if cfg!(windows) { "npx.cmd" } else { "npx" };
        let program = which::which(npx).unwrap_or_else(|_| PathBuf::from(npx));

        let mut args = Vec::new();
        if required_major > 0 {
            args.extend([
                "--yes".to_string(),
                "--package".to_string(),
                format!("appium@{}", required_major),
            ]);
        }
        args.extend([
            "appium".to_string(),
            "--address".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
        ]);

        Self {
            program,
            args,
            log_file: Some(log_file.to_path_buf()),
        }
    }

    pub fn display(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// A running server process owned by the lifecycle manager
pub trait ServerProcess: Send {
    fn id(&self) -> u32;
    fn is_alive(&mut self) -> bool;
    /// Ask the process to exit
    fn terminate(&mut self) -> Result<()>;
    /// Kill without waiting for a graceful exit
    fn kill(&mut self) -> Result<()>;
    /// True if the process exited within `timeout`
    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool>;
}

/// Starts server processes
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerProcess>>;
}

/// Launches real OS processes
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerProcess>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());

        match &spec.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create log directory {}", parent.display())
                    })?;
                }
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open log file {}", path.display()))?;
                let err = log.try_clone()?;
                cmd.stdout(Stdio::from(log)).stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", spec.display()))?;
        log::debug!("Spawned pid {}: {}", child.id(), spec.display());
        Ok(Box::new(ChildProcess { child }))
    }
}

pub struct ChildProcess {
    child: Child,
}

impl ServerProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: signalling a child we spawned and have not reaped yet
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to send SIGTERM to {}", pid));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("Failed to kill server process")?;
        let _ = self.child.wait();
        Ok(())
    }

    fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

/// True if nothing is listening on `host:port`
pub fn is_port_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// First free port in `start..=end`
pub fn find_free_port(host: &str, start: u16, end: u16) -> Option<u16> {
    (start..=end).find(|&p| is_port_free(host, p))
}

/// Hint shown when a spawn fails because the launcher binary is missing
pub fn spawn_hint(err: &anyhow::Error) -> &'static str {
    let msg = format!("{:#}", err).to_lowercase();
    if msg.contains("no such file") || msg.contains("not found") || msg.contains("os error 2") {
        "'npx' was not found. Install Node.js/npm in the environment that runs the tests, \
         or set appium.local=false and point appiumServerUrl/APPIUM_SERVER_URL at an external server."
    } else {
        "See the Appium log file for details."
    }
}
