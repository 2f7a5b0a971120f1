use super::capabilities::{self, Capabilities, PathContext};
use super::remote::{RemoteSession, SessionFactory, WebDriverFactory};
use super::{Platform, Result, SessionError};
use crate::config::Config;
use crate::server::status::{status_url, HttpStatusClient, StatusClient};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Reachability poll before a session is created
#[derive(Debug, Clone, Copy)]
pub struct ReachabilityPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReachabilityPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// A live automation session owned by one lane
pub struct DriverSession {
    platform: Platform,
    capabilities: Capabilities,
    endpoint: String,
    created_at: DateTime<Local>,
    remote: Box<dyn RemoteSession>,
}

impl DriverSession {
    pub fn id(&self) -> &str {
        self.remote.id()
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }
}

impl std::fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSession")
            .field("id", &self.id())
            .field("platform", &self.platform)
            .field("endpoint", &self.endpoint)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Shared factory for per-lane session contexts.
///
/// Sessions themselves are never shared: each [`SessionContext`] owns its
/// session outright. The manager only keeps a registry of live session ids
/// for bookkeeping, which is the one place that takes a lock.
pub struct DriverSessionManager {
    config: Arc<Config>,
    endpoint: String,
    factory: Arc<dyn SessionFactory>,
    status: Arc<dyn StatusClient>,
    reachability: ReachabilityPolicy,
    paths: PathContext,
    live: Mutex<HashMap<String, String>>,
}

impl DriverSessionManager {
    pub fn builder(config: Arc<Config>) -> DriverSessionManagerBuilder {
        DriverSessionManagerBuilder {
            config,
            endpoint: None,
            factory: None,
            status: None,
            reachability: ReachabilityPolicy::default(),
            cwd: None,
        }
    }

    /// Normalized server endpoint sessions connect to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// A fresh, empty context for one execution lane
    pub fn context(self: &Arc<Self>) -> SessionContext {
        SessionContext {
            manager: Arc::clone(self),
            session: None,
        }
    }

    /// Number of sessions currently open across all lanes
    pub fn live_sessions(&self) -> usize {
        self.live.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn capabilities(&self, platform: Platform) -> Result<Capabilities> {
        capabilities::build(platform, &self.config, &self.paths)
    }

    /// Poll `{endpoint}/status` until any HTTP answer below 500 arrives
    pub fn assert_reachable(&self, platform: Platform) -> Result<()> {
        let url = status_url(&self.endpoint);
        let deadline = Instant::now() + self.reachability.timeout;
        let mut last_error = None;

        loop {
            match self.status.get(&url) {
                Ok(reply) if reply.is_reachable() => {
                    log::debug!("Appium reachable at {} (HTTP {})", url, reply.code);
                    return Ok(());
                }
                Ok(reply) => last_error = Some(format!("HTTP {}", reply.code)),
                Err(e) => last_error = Some(format!("{:#}", e)),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(self.reachability.interval.min(deadline - now));
        }

        Err(SessionError::Unreachable {
            hint: self.unreachable_hint(platform),
            url,
            last_error,
        })
    }

    fn unreachable_hint(&self, platform: Platform) -> String {
        let mut hint = platform.troubleshooting_hint().to_string();
        if self.endpoint.contains("host.docker.internal") {
            hint.push_str(
                " If Appium runs on the Docker host, start it with --address 0.0.0.0 \
                 (not 127.0.0.1) and allow TCP 4723 through the host firewall.",
            );
        }
        hint
    }

    fn open(&self, platform: Platform) -> Result<DriverSession> {
        self.assert_reachable(platform)?;
        let caps = self.capabilities(platform)?;

        let remote = self
            .factory
            .create(&self.endpoint, &caps)
            .map_err(|e| SessionError::Create {
                platform,
                endpoint: self.endpoint.clone(),
                reason: format!("{:#}", e),
            })?;

        let session = DriverSession {
            platform,
            capabilities: caps,
            endpoint: self.endpoint.clone(),
            created_at: Local::now(),
            remote,
        };

        let lane = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        if let Ok(mut live) = self.live.lock() {
            live.insert(session.id().to_string(), lane);
        }
        log::info!("Created {} session {} at {}", platform, session.id(), self.endpoint);
        Ok(session)
    }

    fn release(&self, session: &mut DriverSession) {
        if let Err(e) = session.remote.quit() {
            log::warn!("Ignoring error while quitting session {}: {:#}", session.id(), e);
        }
        if let Ok(mut live) = self.live.lock() {
            live.remove(session.id());
        }
    }
}

pub struct DriverSessionManagerBuilder {
    config: Arc<Config>,
    endpoint: Option<String>,
    factory: Option<Arc<dyn SessionFactory>>,
    status: Option<Arc<dyn StatusClient>>,
    reachability: ReachabilityPolicy,
    cwd: Option<PathBuf>,
}

impl DriverSessionManagerBuilder {
    /// Connect here instead of the configured server URL
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn status_client(mut self, status: Arc<dyn StatusClient>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reachability(mut self, policy: ReachabilityPolicy) -> Self {
        self.reachability = policy;
        self
    }

    /// Directory relative app paths resolve against (default: current dir)
    pub fn working_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<DriverSessionManager>> {
        let endpoint = self
            .endpoint
            .unwrap_or_else(|| self.config.server_url())
            .trim()
            .trim_end_matches('/')
            .to_string();

        let factory = match self.factory {
            Some(f) => f,
            None => Arc::new(WebDriverFactory::new()?),
        };
        let status = match self.status {
            Some(s) => s,
            None => Arc::new(HttpStatusClient::new()?),
        };
        let cwd = match self.cwd {
            Some(c) => c,
            None => std::env::current_dir()?,
        };
        let paths = PathContext::from_config(&self.config, cwd);

        Ok(Arc::new(DriverSessionManager {
            config: self.config,
            endpoint,
            factory,
            status,
            reachability: self.reachability,
            paths,
            live: Mutex::new(HashMap::new()),
        }))
    }
}

/// Session slot of one execution lane. Holds at most one live session.
///
/// Owned by the lane, never shared across threads; dropping it quits the
/// session.
pub struct SessionContext {
    manager: Arc<DriverSessionManager>,
    session: Option<DriverSession>,
}

impl SessionContext {
    /// Open a session for `platform` unless this lane already has one
    pub fn init(&mut self, platform: &str) -> Result<()> {
        let platform: Platform = platform.parse()?;
        self.init_platform(platform)
    }

    pub fn init_platform(&mut self, platform: Platform) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        self.session = Some(self.manager.open(platform)?);
        Ok(())
    }

    /// End the session, if any. Teardown errors are logged and ignored; the
    /// slot is cleared either way.
    pub fn quit(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.manager.release(&mut session);
            log::info!("Session {} closed", session.id());
        }
    }

    pub fn current(&self) -> Option<&DriverSession> {
        self.session.as_ref()
    }

    pub fn is_android(&self) -> bool {
        self.platform() == Some(Platform::Android)
    }

    pub fn is_ios(&self) -> bool {
        self.platform() == Some(Platform::Ios)
    }

    /// The session if it is an Android one
    pub fn android(&self) -> Option<&DriverSession> {
        self.current().filter(|s| s.platform == Platform::Android)
    }

    /// The session if it is an iOS one
    pub fn ios(&self) -> Option<&DriverSession> {
        self.current().filter(|s| s.platform == Platform::Ios)
    }

    fn platform(&self) -> Option<Platform> {
        self.session.as_ref().map(|s| s.platform)
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.quit();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::server::status::tests::{ok_body, ScriptedStatus};
    use crate::server::status::StatusReply;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Factory handing out numbered in-memory sessions
    #[derive(Default)]
    pub(crate) struct FakeFactory {
        pub created: AtomicUsize,
        pub quits: Arc<AtomicUsize>,
        pub fail_quit: Arc<AtomicBool>,
        pub last_caps: Mutex<Option<Capabilities>>,
    }

    struct FakeRemote {
        id: String,
        quits: Arc<AtomicUsize>,
        fail_quit: Arc<AtomicBool>,
    }

    impl RemoteSession for FakeRemote {
        fn id(&self) -> &str {
            &self.id
        }

        fn quit(&mut self) -> anyhow::Result<()> {
            self.quits.fetch_add(1, Ordering::SeqCst);
            if self.fail_quit.load(Ordering::SeqCst) {
                anyhow::bail!("invalid session id");
            }
            Ok(())
        }
    }

    impl SessionFactory for FakeFactory {
        fn create(&self, _endpoint: &str, caps: &Capabilities) -> anyhow::Result<Box<dyn RemoteSession>> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_caps.lock().unwrap() = Some(caps.clone());
            Ok(Box::new(FakeRemote {
                id: format!("session-{}", n),
                quits: self.quits.clone(),
                fail_quit: self.fail_quit.clone(),
            }))
        }
    }

    fn fast() -> ReachabilityPolicy {
        ReachabilityPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        }
    }

    pub(crate) fn ios_config() -> Arc<Config> {
        Arc::new(
            Config::builder()
                .file("/no/such/file")
                .env(HashMap::new())
                .set("bundleId", "com.acme.app")
                .build(),
        )
    }

    fn manager(factory: Arc<FakeFactory>, status: ScriptedStatus) -> Arc<DriverSessionManager> {
        DriverSessionManager::builder(ios_config())
            .endpoint("http://127.0.0.1:4723/")
            .factory(factory)
            .status_client(Arc::new(status))
            .reachability(fast())
            .working_dir("/tmp")
            .build()
            .unwrap()
    }

    #[test]
    fn test_init_is_reentrant() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(factory.clone(), ScriptedStatus::version("2.0.0"));
        let mut ctx = mgr.context();

        ctx.init("iOS").unwrap();
        let first = ctx.current().unwrap().id().to_string();
        ctx.init("iOS").unwrap();

        assert_eq!(ctx.current().unwrap().id(), first);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(ctx.is_ios());
        assert!(!ctx.is_android());
        assert!(ctx.android().is_none());
        assert_eq!(ctx.ios().unwrap().endpoint(), "http://127.0.0.1:4723");
        assert_eq!(mgr.live_sessions(), 1);
    }

    #[test]
    fn test_quit_then_init_creates_fresh_session() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(factory.clone(), ScriptedStatus::version("2.0.0"));
        let mut ctx = mgr.context();

        ctx.quit();
        assert_eq!(factory.quits.load(Ordering::SeqCst), 0);

        ctx.init("iOS").unwrap();
        let first = ctx.current().unwrap().id().to_string();
        ctx.quit();
        assert!(ctx.current().is_none());
        assert_eq!(mgr.live_sessions(), 0);

        ctx.init("iOS").unwrap();
        assert_ne!(ctx.current().unwrap().id(), first);
    }

    #[test]
    fn test_quit_swallows_teardown_error() {
        let factory = Arc::new(FakeFactory::default());
        factory.fail_quit.store(true, Ordering::SeqCst);
        let mgr = manager(factory.clone(), ScriptedStatus::version("2.0.0"));
        let mut ctx = mgr.context();

        ctx.init("iOS").unwrap();
        ctx.quit();
        assert!(ctx.current().is_none());
        assert_eq!(factory.quits.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.live_sessions(), 0);
    }

    #[test]
    fn test_lanes_are_independent() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(factory.clone(), ScriptedStatus::version("2.0.0"));

        let ids: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let mut ctx = mgr.context();
                    s.spawn(move || {
                        assert!(ctx.current().is_none());
                        ctx.init("iOS").unwrap();
                        let id = ctx.current().unwrap().id().to_string();
                        // keep the session open until both lanes have one
                        std::thread::sleep(Duration::from_millis(20));
                        id
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_ne!(ids[0], ids[1]);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        // both contexts were dropped with their threads
        assert_eq!(factory.quits.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.live_sessions(), 0);
    }

    #[test]
    fn test_unreachable_endpoint() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(factory.clone(), ScriptedStatus::down());
        let mut ctx = mgr.context();

        let err = ctx.init("Android").unwrap_err();
        match &err {
            SessionError::Unreachable { url, last_error, .. } => {
                assert_eq!(url, "http://127.0.0.1:4723/status");
                assert!(last_error.as_deref().unwrap().contains("refused"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("uiautomator2"));
        assert!(ctx.current().is_none());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_client_errors_count_as_reachable() {
        let factory = Arc::new(FakeFactory::default());
        let status = ScriptedStatus::new(vec![
            Some(StatusReply {
                code: 503,
                body: String::new(),
            }),
            Some(StatusReply {
                code: 404,
                body: String::new(),
            }),
        ]);
        let mgr = manager(factory.clone(), status);
        let mut ctx = mgr.context();
        ctx.init("ios").unwrap();
        assert!(ctx.is_ios());
    }

    #[test]
    fn test_docker_hint() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = DriverSessionManager::builder(ios_config())
            .endpoint("http://host.docker.internal:4723")
            .factory(factory)
            .status_client(Arc::new(ScriptedStatus::down()))
            .reachability(fast())
            .working_dir("/tmp")
            .build()
            .unwrap();
        let err = mgr.context().init("iOS").unwrap_err();
        assert!(err.to_string().contains("0.0.0.0"));
    }

    #[test]
    fn test_missing_app_aborts_init() {
        let factory = Arc::new(FakeFactory::default());
        let cfg = Arc::new(
            Config::builder()
                .file("/no/such/file")
                .env(HashMap::new())
                .set("appPath", "does/not/exist.apk")
                .build(),
        );
        let dir = tempfile::tempdir().unwrap();
        let mgr = DriverSessionManager::builder(cfg)
            .endpoint("http://127.0.0.1:4723")
            .factory(factory.clone())
            .status_client(Arc::new(ScriptedStatus::new(vec![Some(ok_body("{}"))])))
            .reachability(fast())
            .working_dir(dir.path())
            .build()
            .unwrap();

        let err = mgr.context().init("Android").unwrap_err();
        assert!(matches!(err, SessionError::AppNotFound { .. }));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_platform() {
        let factory = Arc::new(FakeFactory::default());
        let mgr = manager(factory, ScriptedStatus::version("2.0.0"));
        assert!(matches!(
            mgr.context().init("Symbian"),
            Err(SessionError::UnknownPlatform(_))
        ));
    }
}
