use crate::config::{self, Config};
use dashmap::{DashMap, DashSet};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Retry settings for a test known to be flaky. Takes full precedence over
/// the configured defaults, delay included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakyPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub reason: String,
    pub bug_id: String,
}

impl Default for FlakyPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(1000),
            reason: String::new(),
            bug_id: String::new(),
        }
    }
}

impl FlakyPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            ..Default::default()
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn bug_id(mut self, bug_id: impl Into<String>) -> Self {
        self.bug_id = bug_id.into();
        self
    }
}

/// Wakes lanes sleeping in a retry delay
#[derive(Default)]
struct DelayInterrupt {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl DelayInterrupt {
    fn interrupt(&self) {
        if let Ok(mut generation) = self.generation.lock() {
            *generation += 1;
        }
        self.cond.notify_all();
    }

    /// Sleep for `delay` unless interrupted first. Returns true when cut short.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let Ok(mut generation) = self.generation.lock() else {
            thread::sleep(delay);
            return false;
        };
        let start = *generation;

        while *generation == start {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            generation = match self.cond.wait_timeout(generation, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
        true
    }
}

type RetryKey = (String, ThreadId);

/// Decides whether a failed test gets another attempt.
///
/// Counters are keyed by test name and the calling thread, so the same test
/// running in two lanes never shares a count. A key whose retries ran out is
/// remembered as exhausted until [`RetryPolicy::begin`] starts a fresh
/// invocation of that test on the lane.
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
    flaky: DashMap<String, FlakyPolicy>,
    counters: DashMap<RetryKey, u32>,
    exhausted: DashSet<RetryKey>,
    interrupt: DelayInterrupt,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            flaky: DashMap::new(),
            counters: DashMap::new(),
            exhausted: DashSet::new(),
            interrupt: DelayInterrupt::default(),
        }
    }

    /// Defaults from `retry.count` and `retry.delay.ms`
    pub fn from_config(config: &Config) -> config::Result<Self> {
        Ok(Self::new(config.retry_count()?, config.retry_delay()?))
    }

    pub fn mark_flaky(&self, test: &str, policy: FlakyPolicy) {
        self.flaky.insert(test.to_string(), policy);
    }

    pub fn flaky(&self, test: &str) -> Option<FlakyPolicy> {
        self.flaky.get(test).map(|p| p.clone())
    }

    /// Called after a failure of `test` on the current lane. On `true` the
    /// retry delay has already elapsed and the caller re-runs the test.
    ///
    /// Once this has returned `false` it keeps returning `false` for the
    /// same test on this lane. Callers must call [`RetryPolicy::begin`]
    /// before every fresh invocation of a test (and may call
    /// [`RetryPolicy::record_success`] when it passes) to start counting at 0
    /// again.
    pub fn should_retry(&self, test: &str) -> bool {
        let key = key(test);
        if self.exhausted.contains(&key) {
            return false;
        }

        let flaky = self.flaky(test);
        let (max_retries, delay) = match &flaky {
            Some(f) => (f.max_retries, f.delay),
            None => (self.max_retries, self.delay),
        };

        // the entry guard must be released before sleeping
        let attempt = {
            let mut count = self.counters.entry(key.clone()).or_insert(0);
            if *count < max_retries {
                *count += 1;
                Some(*count)
            } else {
                None
            }
        };

        match attempt {
            Some(n) => {
                match &flaky {
                    Some(f) if !f.reason.is_empty() || !f.bug_id.is_empty() => log::info!(
                        "Retrying flaky test '{}' - attempt {}/{} (reason: {}, bug: {})",
                        test,
                        n,
                        max_retries,
                        or_dash(&f.reason),
                        or_dash(&f.bug_id)
                    ),
                    _ => log::info!("Retrying test '{}' - attempt {}/{}", test, n, max_retries),
                }
                if !delay.is_zero() && self.interrupt.sleep(delay) {
                    log::debug!("Retry delay for '{}' interrupted", test);
                }
                true
            }
            None => {
                self.counters.remove(&key);
                self.exhausted.insert(key);
                log::debug!("Retries exhausted for '{}'", test);
                false
            }
        }
    }

    /// Start a fresh invocation of `test` on this lane
    pub fn begin(&self, test: &str) {
        let key = key(test);
        self.counters.remove(&key);
        self.exhausted.remove(&key);
    }

    /// Drop retry state once `test` has passed on this lane
    pub fn record_success(&self, test: &str) {
        self.begin(test);
    }

    /// Retries consumed so far by `test` on this lane
    pub fn retry_count(&self, test: &str) -> u32 {
        self.counters.get(&key(test)).map(|c| *c).unwrap_or(0)
    }

    /// Clear every counter (suite start)
    pub fn reset_all(&self) {
        self.counters.clear();
        self.exhausted.clear();
    }

    /// Cut short any retry delay in progress. The retry itself still happens.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}

fn key(test: &str) -> RetryKey {
    (test.to_string(), thread::current().id())
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}
