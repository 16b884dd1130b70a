use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration, time::Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Windows kept before stale entries are swept.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerClass {
    /// Job creation, retry and confirmation: each may start paid AI work.
    Expensive,
    Standard,
    Read,
    /// Extract/enrich invocations made by the orchestrator on a tenant's behalf.
    Stage,
}

impl CallerClass {
    pub fn as_str(self) -> &'static str {
        match self {
            CallerClass::Expensive => "expensive",
            CallerClass::Standard => "standard",
            CallerClass::Read => "read",
            CallerClass::Stage => "stage",
        }
    }
}

impl fmt::Display for CallerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub limit: u32,
    pub window: Duration,
}

impl WindowLimit {
    pub const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub expensive: WindowLimit,
    pub standard: WindowLimit,
    pub read: WindowLimit,
    pub stage: WindowLimit,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            expensive: WindowLimit::per_minute(10),
            standard: WindowLimit::per_minute(30),
            read: WindowLimit::per_minute(120),
            stage: WindowLimit::per_minute(20),
        }
    }
}

impl AdmissionConfig {
    pub fn for_class(&self, class: CallerClass) -> WindowLimit {
        match class {
            CallerClass::Expensive => self.expensive,
            CallerClass::Standard => self.standard,
            CallerClass::Read => self.read,
            CallerClass::Stage => self.stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Throttled {
        limit: u32,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

struct WindowState {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter per `(class, caller key)`.
pub struct AdmissionController {
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<(CallerClass, String), WindowState>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, class: CallerClass, caller_key: &str) -> Admission {
        let WindowLimit { limit, window } = self.config.for_class(class);
        let now = self.clock.now();
        let mut guard = self.windows.lock().await;

        if guard.len() > PRUNE_THRESHOLD {
            let before = guard.len();
            guard.retain(|(kind, _), state| {
                now.duration_since(state.started) < self.config.for_class(*kind).window
            });
            debug!(
                target = "catalog.admission",
                pruned = before - guard.len(),
                "stale_windows_pruned"
            );
        }

        let state = guard
            .entry((class, caller_key.to_string()))
            .or_insert(WindowState {
                started: now,
                count: 0,
            });
        if now.duration_since(state.started) >= window {
            state.started = now;
            state.count = 0;
        }

        let reset_after = window.saturating_sub(now.duration_since(state.started));
        if state.count < limit {
            state.count += 1;
            Admission::Admitted {
                limit,
                remaining: limit - state.count,
                reset_after,
            }
        } else {
            crate::metrics::throttled(class.as_str());
            Admission::Throttled {
                limit,
                retry_after: reset_after.max(Duration::from_millis(1)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;

    fn controller(limit: u32, clock: Arc<ManualClock>) -> AdmissionController {
        let window = WindowLimit {
            limit,
            window: Duration::from_secs(10),
        };
        let config = AdmissionConfig {
            expensive: window,
            standard: window,
            read: WindowLimit {
                limit: limit * 10,
                window: Duration::from_secs(10),
            },
            stage: window,
        };
        AdmissionController::new(config, clock)
    }

    #[tokio::test]
    async fn throttles_after_limit_and_recovers_after_window() {
        let clock = Arc::new(ManualClock::new());
        let admission = controller(3, clock.clone());
        for expected_remaining in [2, 1, 0] {
            match admission.allow(CallerClass::Expensive, "acme").await {
                Admission::Admitted { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("expected admission, got {other:?}"),
            }
        }

        clock.advance(Duration::from_secs(4));
        match admission.allow(CallerClass::Expensive, "acme").await {
            Admission::Throttled { retry_after, limit } => {
                assert_eq!(limit, 3);
                assert!(retry_after > Duration::ZERO);
                assert_eq!(retry_after, Duration::from_secs(6));
            }
            other => panic!("expected throttle, got {other:?}"),
        }

        clock.advance(Duration::from_secs(6));
        assert!(admission.allow(CallerClass::Expensive, "acme").await.is_admitted());
    }

    #[tokio::test]
    async fn keys_and_classes_have_independent_windows() {
        let clock = Arc::new(ManualClock::new());
        let admission = controller(1, clock);
        assert!(admission.allow(CallerClass::Expensive, "acme").await.is_admitted());
        assert!(!admission.allow(CallerClass::Expensive, "acme").await.is_admitted());
        assert!(admission.allow(CallerClass::Expensive, "globex").await.is_admitted());
        for _ in 0..10 {
            assert!(admission.allow(CallerClass::Read, "acme").await.is_admitted());
        }
        assert!(!admission.allow(CallerClass::Read, "acme").await.is_admitted());
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_the_limit() {
        let clock = Arc::new(ManualClock::new());
        let admission = Arc::new(controller(25, clock));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let admission = admission.clone();
            handles.push(tokio::spawn(async move {
                admission.allow(CallerClass::Expensive, "acme").await.is_admitted()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("task") {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);
    }
}
