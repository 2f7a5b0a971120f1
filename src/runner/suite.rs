use super::context::TestContext;
use crate::config::Config;
use crate::report::{ReportSink, TestStatus};
use crate::retry::{FlakyPolicy, RetryPolicy};
use crate::server::status::StatusClient;
use crate::server::ServerLifecycleManager;
use crate::session::{DriverSessionManager, Platform, ReachabilityPolicy, SessionContext, SessionFactory};
use anyhow::{Context, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type TestBody = Box<dyn Fn(&mut TestContext<'_>) -> Result<()> + Send + Sync>;

/// A registered test
pub struct TestCase {
    pub name: String,
    pub flaky: Option<FlakyPolicy>,
    pub body: TestBody,
}

impl TestCase {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut TestContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            flaky: None,
            body: Box::new(body),
        }
    }

    /// Mark as flaky: its own retry count and delay replace the defaults
    pub fn flaky(mut self, policy: FlakyPolicy) -> Self {
        self.flaky = Some(policy);
        self
    }
}

/// Outcome of one test after all its attempts
#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub name: String,
    pub status: TestStatus,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SuiteSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Tests that needed at least one retry, whatever their final status
    pub retried: usize,
    pub duration: Duration,
    pub outcomes: Vec<CaseOutcome>,
}

impl SuiteSummary {
    fn from_outcomes(mut outcomes: Vec<CaseOutcome>, duration: Duration) -> Self {
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            total: outcomes.len(),
            passed: outcomes.iter().filter(|o| o.status == TestStatus::Passed).count(),
            failed: outcomes.iter().filter(|o| o.status == TestStatus::Failed).count(),
            retried: outcomes.iter().filter(|o| o.attempts > 1).count(),
            duration,
            outcomes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn outcome(&self, name: &str) -> Option<&CaseOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// Runs registered tests against one server across `thread.count` lanes.
///
/// Each lane owns its session context: a session is opened before a test and
/// quit after its final attempt. Failed attempts go through the retry
/// policy; only final results reach the report sink. The server is shut
/// down when the run ends, whatever the outcome.
pub struct SuiteRunner {
    config: Arc<Config>,
    sink: Arc<dyn ReportSink>,
    server: Option<Arc<ServerLifecycleManager>>,
    factory: Option<Arc<dyn SessionFactory>>,
    status: Option<Arc<dyn StatusClient>>,
    reachability: ReachabilityPolicy,
    retry: Option<Arc<RetryPolicy>>,
    cases: Vec<TestCase>,
}

impl SuiteRunner {
    pub fn new(config: Arc<Config>, sink: Arc<dyn ReportSink>) -> Self {
        Self {
            config,
            sink,
            server: None,
            factory: None,
            status: None,
            reachability: ReachabilityPolicy::default(),
            retry: None,
            cases: Vec::new(),
        }
    }

    pub fn server(mut self, server: Arc<ServerLifecycleManager>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
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

    /// Share a policy, e.g. to interrupt retry delays from a signal handler
    pub fn retry_policy(mut self, policy: Arc<RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn add(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    pub fn run(&self) -> Result<SuiteSummary> {
        let server = match &self.server {
            Some(s) => s.clone(),
            None => Arc::new(ServerLifecycleManager::new(self.config.clone())?),
        };

        let result = self.run_with(&server);
        server.shutdown();
        if let Err(e) = self.sink.finish() {
            log::warn!("Failed to finish report: {:#}", e);
        }
        result
    }

    fn run_with(&self, server: &ServerLifecycleManager) -> Result<SuiteSummary> {
        server
            .ensure_started()
            .context("Failed to provide an Appium server")?;

        let endpoint = server
            .endpoint()
            .unwrap_or_else(|| self.config.server_url());

        let mut builder = DriverSessionManager::builder(self.config.clone())
            .endpoint(endpoint.as_str())
            .reachability(self.reachability);
        if let Some(factory) = &self.factory {
            builder = builder.factory(factory.clone());
        }
        if let Some(status) = &self.status {
            builder = builder.status_client(status.clone());
        }
        let sessions = builder.build()?;

        let retry = match &self.retry {
            Some(r) => r.clone(),
            None => Arc::new(RetryPolicy::from_config(&self.config)?),
        };
        retry.reset_all();
        for case in &self.cases {
            if let Some(flaky) = &case.flaky {
                retry.mark_flaky(&case.name, flaky.clone());
            }
        }

        let platform: Platform = self.config.platform().parse()?;
        let lanes = self.config.thread_count()?.min(self.cases.len()).max(1);
        log::info!(
            "Running {} test(s) on {} lane(s) against {} ({})",
            self.cases.len(),
            lanes,
            endpoint,
            platform
        );

        let started = Instant::now();
        let next = AtomicUsize::new(0);

        let lane_results = thread::scope(|s| -> Result<Vec<Result<Vec<CaseOutcome>>>> {
            let (sessions, retry, next) = (&sessions, retry.as_ref(), &next);
            let mut handles = Vec::with_capacity(lanes);
            for lane in 0..lanes {
                let handle = thread::Builder::new()
                    .name(format!("lane-{}", lane))
                    .spawn_scoped(s, move || {
                        let mut session = sessions.context();
                        let outcomes = self.run_lane(lane, platform, &mut session, retry, next);
                        session.quit();
                        outcomes
                    })
                    .context("Failed to spawn execution lane")?;
                handles.push(handle);
            }

            Ok(handles
                .into_iter()
                .enumerate()
                .map(|(lane, h)| {
                    h.join()
                        .map_err(|_| anyhow::anyhow!("Execution lane {} panicked", lane))
                })
                .collect())
        })?;

        let mut outcomes = Vec::new();
        for result in lane_results {
            outcomes.append(&mut result?);
        }

        let summary = SuiteSummary::from_outcomes(outcomes, started.elapsed());
        log::info!(
            "Suite finished: {} passed, {} failed, {} retried in {:.1}s",
            summary.passed,
            summary.failed,
            summary.retried,
            summary.duration.as_secs_f64()
        );
        Ok(summary)
    }

    fn run_lane(
        &self,
        lane: usize,
        platform: Platform,
        session: &mut SessionContext,
        retry: &RetryPolicy,
        next: &AtomicUsize,
    ) -> Vec<CaseOutcome> {
        let mut outcomes = Vec::new();
        while let Some(case) = self.cases.get(next.fetch_add(1, Ordering::SeqCst)) {
            outcomes.push(self.run_case(case, lane, platform, session, retry));
        }
        outcomes
    }

    /// All attempts of one test. A session that cannot be opened fails
    /// this test only; the lane goes on with the next one.
    fn run_case(
        &self,
        case: &TestCase,
        lane: usize,
        platform: Platform,
        session: &mut SessionContext,
        retry: &RetryPolicy,
    ) -> CaseOutcome {
        retry.begin(&case.name);
        let started = Instant::now();
        let mut attempt = 1;

        let error = loop {
            if let Err(e) = session.init_platform(platform) {
                log::error!("Cannot open a session for '{}': {}", case.name, e);
                break Some(format!("Cannot open a session: {}", e));
            }

            let result = {
                let mut ctx = TestContext::new(
                    &case.name,
                    attempt,
                    lane,
                    &self.config,
                    session,
                    self.sink.as_ref(),
                );
                panic::catch_unwind(AssertUnwindSafe(|| (case.body)(&mut ctx)))
                    .unwrap_or_else(|payload| Err(panic_error(payload)))
            };

            match result {
                Ok(()) => {
                    retry.record_success(&case.name);
                    break None;
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    log::warn!("'{}' failed on attempt {}: {}", case.name, attempt, message);
                    if !retry.should_retry(&case.name) {
                        break Some(message);
                    }
                    self.sink.record_retry(&case.name, retry.retry_count(&case.name));
                    attempt += 1;
                }
            }
        };

        session.quit();

        let status = match &error {
            None => TestStatus::Passed,
            Some(message) => {
                if let Err(e) = self.sink.attach(
                    &format!("{} - failure", case.name),
                    message.as_bytes(),
                    "text/plain",
                ) {
                    log::warn!("Failed to attach failure details: {:#}", e);
                }
                TestStatus::Failed
            }
        };
        self.report(&case.name, status, started, error.as_deref());

        CaseOutcome {
            name: case.name.clone(),
            status,
            attempts: attempt,
            duration: started.elapsed(),
            error,
        }
    }

    fn report(&self, name: &str, status: TestStatus, started: Instant, error: Option<&str>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.sink.record_result(name, status, duration_ms, error) {
            log::warn!("Failed to record result of '{}': {:#}", name, e);
        }
    }
}

/// Turn a panic payload from a test body into an ordinary failure
fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    anyhow::anyhow!("test panicked: {}", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::json::JsonReportSink;
    use crate::server::status::tests::ScriptedStatus;
    use crate::server::ServerState;
    use crate::session::manager::tests::FakeFactory;
    use crate::session::{Capabilities, RemoteSession};
    use crate::testing::FakeAppium;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    fn fast() -> ReachabilityPolicy {
        ReachabilityPolicy {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        }
    }

    fn config(pairs: &[(&str, &str)]) -> Arc<Config> {
        let mut builder = Config::builder()
            .file("/no/such/config.properties")
            .env(HashMap::new())
            .set("retry.delay.ms", "0");
        for (k, v) in pairs {
            builder = builder.set(k, v);
        }
        Arc::new(builder.build())
    }

    #[test]
    fn test_suite_against_external_server() {
        let appium = FakeAppium::start("2.11.2");
        let dir = tempfile::tempdir().unwrap();
        let apk = dir.path().join("app.apk");
        std::fs::write(&apk, b"apk").unwrap();
        let reports = dir.path().join("reports");
        let server_url = format!("{}/", appium.url);
        let app_path = apk.to_string_lossy().to_string();

        let cfg = config(&[
            ("appium.local", "false"),
            ("appiumServerUrl", server_url.as_str()),
            ("platform", "Android"),
            ("appPath", app_path.as_str()),
            ("retry.count", "1"),
        ]);
        let sink = Arc::new(JsonReportSink::new(&reports));
        let server = Arc::new(ServerLifecycleManager::new(cfg.clone()).unwrap());

        let flaky_runs = Arc::new(AtomicUsize::new(0));
        let counter = flaky_runs.clone();

        let summary = SuiteRunner::new(cfg, sink.clone())
            .server(server.clone())
            .reachability(fast())
            .add(TestCase::new("opens app", |ctx| {
                assert!(ctx.is_android());
                assert!(!ctx.session()?.id().is_empty());
                ctx.attach("note", b"ok", "text/plain")
            }))
            .add(
                TestCase::new("flaky swipe", move |ctx| {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("element not found on attempt {}", ctx.attempt);
                    }
                    Ok(())
                })
                .flaky(FlakyPolicy::new(2, Duration::ZERO).reason("animation")),
            )
            .add(TestCase::new("always broken", |_| {
                anyhow::bail!("assertion failed")
            }))
            .run()
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retried, 2);
        assert!(!summary.is_success());
        assert_eq!(summary.outcome("flaky swipe").unwrap().attempts, 2);
        assert_eq!(summary.outcome("always broken").unwrap().attempts, 2);
        assert_eq!(flaky_runs.load(Ordering::SeqCst), 2);

        // one session per test, reused across that test's retries
        assert_eq!(appium.state.created.load(Ordering::SeqCst), 3);
        assert_eq!(appium.state.deleted.load(Ordering::SeqCst), 3);
        assert_eq!(server.state(), ServerState::NotStarted);

        let results = sink.results();
        assert_eq!(results.summary.failed, 1);
        assert!(reports.join("results.json").exists());
        let broken = results
            .results
            .iter()
            .find(|r| r.name == "always broken")
            .unwrap();
        assert_eq!(broken.retries, 1);
        assert_eq!(broken.error.as_deref(), Some("assertion failed"));
        assert_eq!(results.attachments.len(), 2);
    }

    #[test]
    fn test_lanes_run_in_parallel() {
        let cfg = config(&[("platform", "iOS"), ("thread.count", "2")]);
        let factory = Arc::new(FakeFactory::default());
        let dir = tempfile::tempdir().unwrap();
        let lanes_seen = Arc::new(Mutex::new(HashSet::new()));

        let mut runner = SuiteRunner::new(cfg, Arc::new(JsonReportSink::new(dir.path())))
            .session_factory(factory.clone())
            .status_client(Arc::new(ScriptedStatus::version("2.0.0")))
            .reachability(fast());
        for i in 0..4 {
            let seen = lanes_seen.clone();
            runner = runner.add(TestCase::new(format!("case {}", i), move |ctx| {
                ctx.session()?;
                let name = thread::current().name().unwrap_or_default().to_string();
                seen.lock().unwrap().insert(name);
                thread::sleep(Duration::from_millis(30));
                Ok(())
            }));
        }

        let summary = runner.run().unwrap();
        assert_eq!(summary.passed, 4);
        assert_eq!(factory.created.load(Ordering::SeqCst), 4);
        assert_eq!(factory.quits.load(Ordering::SeqCst), 4);

        let seen = lanes_seen.lock().unwrap();
        assert!(!seen.is_empty() && seen.len() <= 2);
        assert!(seen.iter().all(|n| n.starts_with("lane-")));
    }

    /// Refuses the first session, then behaves like [`FakeFactory`]
    struct RefuseFirst {
        inner: FakeFactory,
        refused: AtomicBool,
    }

    impl SessionFactory for RefuseFirst {
        fn create(
            &self,
            endpoint: &str,
            caps: &Capabilities,
        ) -> anyhow::Result<Box<dyn RemoteSession>> {
            if !self.refused.swap(true, Ordering::SeqCst) {
                anyhow::bail!("device busy");
            }
            self.inner.create(endpoint, caps)
        }
    }

    #[test]
    fn test_unreachable_server_fails_each_test() {
        let cfg = config(&[("platform", "iOS"), ("appium.local", "false")]);
        let factory = Arc::new(FakeFactory::default());
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonReportSink::new(dir.path()));
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let summary = SuiteRunner::new(cfg, sink.clone())
            .session_factory(factory.clone())
            .status_client(Arc::new(ScriptedStatus::down()))
            .reachability(fast())
            .add(TestCase::new("never runs", move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .add(TestCase::new("never runs either", |_| Ok(())))
            .run()
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert!(summary
            .outcome("never runs")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("Cannot reach Appium server"));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert_eq!(sink.results().summary.failed, 2);
        assert!(dir.path().join("results.json").exists());
    }

    #[test]
    fn test_session_failure_fails_only_that_test() {
        let cfg = config(&[("platform", "iOS"), ("thread.count", "1")]);
        let factory = Arc::new(RefuseFirst {
            inner: FakeFactory::default(),
            refused: AtomicBool::new(false),
        });
        let dir = tempfile::tempdir().unwrap();
        let second_ran = Arc::new(AtomicBool::new(false));
        let flag = second_ran.clone();

        let summary = SuiteRunner::new(cfg, Arc::new(JsonReportSink::new(dir.path())))
            .session_factory(factory.clone())
            .status_client(Arc::new(ScriptedStatus::version("2.0.0")))
            .reachability(fast())
            .add(TestCase::new("a first", |_| Ok(())))
            .add(TestCase::new("b second", move |ctx| {
                ctx.session()?;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .run()
            .unwrap();

        assert!(second_ran.load(Ordering::SeqCst));
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 1);
        let first = summary.outcome("a first").unwrap();
        assert_eq!(first.status, TestStatus::Failed);
        assert!(first.error.as_deref().unwrap().contains("device busy"));
        assert_eq!(factory.inner.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_body_is_an_ordinary_failure() {
        let cfg = config(&[("platform", "iOS"), ("retry.count", "1")]);
        let factory = Arc::new(FakeFactory::default());
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(JsonReportSink::new(dir.path()));
        let panics = Arc::new(AtomicUsize::new(0));
        let counter = panics.clone();

        let summary = SuiteRunner::new(cfg, sink.clone())
            .session_factory(factory.clone())
            .status_client(Arc::new(ScriptedStatus::version("2.0.0")))
            .reachability(fast())
            .add(TestCase::new("a panics", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(1, 2, "totals differ");
                Ok(())
            }))
            .add(TestCase::new("b fine", |_| Ok(())))
            .run()
            .unwrap();

        // the panic went through the retry policy like any failure
        assert_eq!(panics.load(Ordering::SeqCst), 2);
        let failed = summary.outcome("a panics").unwrap();
        assert_eq!(failed.status, TestStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(failed.error.as_deref().unwrap().contains("totals differ"));
        assert_eq!(summary.outcome("b fine").unwrap().status, TestStatus::Passed);
        assert_eq!(sink.results().summary.total, 2);
        assert_eq!(factory.quits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_platform_is_reported() {
        let cfg = config(&[("platform", "Windows Phone")]);
        let dir = tempfile::tempdir().unwrap();
        let err = SuiteRunner::new(cfg, Arc::new(JsonReportSink::new(dir.path())))
            .session_factory(Arc::new(FakeFactory::default()))
            .status_client(Arc::new(ScriptedStatus::version("2.0.0")))
            .add(TestCase::new("t", |_| Ok(())))
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("Windows Phone"));
    }
}
