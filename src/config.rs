use crate::{
    admission::{AdmissionConfig, WindowLimit},
    gate::GateConfig,
    models::Stage,
};
use rand::Rng;
use std::{collections::BTreeMap, env, str::FromStr, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    /// Attempts allowed within one `run` invocation.
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay that may be added at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(attempt - 1)`, capped at `max`, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }

    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_millis() as f64 * self.jitter.min(1.0);
        let extra = rand::rng().random_range(0.0..=spread);
        (delay + Duration::from_millis(extra as u64)).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stage_policies: BTreeMap<Stage, StagePolicy>,
    pub backoff: BackoffPolicy,
    pub gate: GateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_policies: BTreeMap::new(),
            backoff: BackoffPolicy::default(),
            gate: GateConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn policy(&self, stage: Stage) -> StagePolicy {
        self.stage_policies.get(&stage).copied().unwrap_or_default()
    }

    pub fn from_env() -> Self {
        let defaults = StagePolicy::default();
        let max_attempts = parse_env("STAGE_MAX_ATTEMPTS")
            .filter(|v: &u32| *v > 0)
            .unwrap_or(defaults.max_attempts);
        let timeout_secs = parse_env("STAGE_TIMEOUT_SECS")
            .filter(|v: &u64| *v > 0)
            .unwrap_or(defaults.timeout.as_secs());

        let stage_policies = Stage::PIPELINE
            .iter()
            .map(|stage| {
                let name = stage.as_str().to_ascii_uppercase();
                let policy = StagePolicy {
                    max_attempts: parse_env(&format!("STAGE_{name}_MAX_ATTEMPTS"))
                        .filter(|v: &u32| *v > 0)
                        .unwrap_or(max_attempts),
                    timeout: Duration::from_secs(
                        parse_env(&format!("STAGE_{name}_TIMEOUT_SECS"))
                            .filter(|v: &u64| *v > 0)
                            .unwrap_or(timeout_secs),
                    ),
                };
                (*stage, policy)
            })
            .collect();

        let backoff_defaults = BackoffPolicy::default();
        let backoff = BackoffPolicy {
            base: parse_env("BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(backoff_defaults.base),
            max: parse_env("BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(backoff_defaults.max),
            jitter: parse_env("BACKOFF_JITTER")
                .filter(|v: &f64| (0.0..=1.0).contains(v))
                .unwrap_or(backoff_defaults.jitter),
        };

        Self {
            stage_policies,
            backoff,
            gate: gate_from_env(),
        }
    }
}

fn gate_from_env() -> GateConfig {
    let mut gate = GateConfig::default();
    if let Ok(raw) = env::var("GATE_ALLOWED_TAGS") {
        gate = gate.with_allowed_tags(raw.split([',', ' ']));
    }
    if let Some(v) = parse_env("GATE_MIN_TITLE_LEN") {
        gate.min_title_len = v;
    }
    if let Some(v) = parse_env::<usize>("GATE_MAX_TITLE_LEN").filter(|v| *v > 0) {
        gate.max_title_len = v;
    }
    if let Some(v) = parse_env::<usize>("GATE_MAX_DESCRIPTION_LEN").filter(|v| *v > 0) {
        gate.max_description_len = v;
    }
    if let Some(v) = parse_env::<usize>("GATE_MAX_TAGS") {
        gate.max_tags = v;
    }
    if let Some(v) = parse_env::<f64>("GATE_MIN_PRICE").filter(|v| v.is_finite()) {
        gate.min_price = v;
    }
    if let Some(v) = parse_env::<f64>("GATE_MAX_PRICE").filter(|v| v.is_finite()) {
        gate.max_price = v;
    }
    gate
}

pub fn admission_from_env() -> AdmissionConfig {
    let defaults = AdmissionConfig::default();
    let window = |name: &str, fallback: WindowLimit| WindowLimit {
        limit: parse_env(&format!("ADMISSION_{name}_LIMIT")).unwrap_or(fallback.limit),
        window: parse_env(&format!("ADMISSION_{name}_WINDOW_SECS"))
            .filter(|v: &u64| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(fallback.window),
    };
    AdmissionConfig {
        expensive: window("EXPENSIVE", defaults.expensive),
        standard: window("STANDARD", defaults.standard),
        read: window("READ", defaults.read),
        stage: window("STAGE", defaults.stage),
    }
}

pub fn parse_env_bool(name: &str) -> bool {
    env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        })
        .unwrap_or(false)
}

pub fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}
