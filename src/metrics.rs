use tracing::trace;

// Counters are emitted as trace events; the Prometheus handle only renders
// whatever recorder is installed at startup.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "catalog.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn job_transition(stage: &'static str, status: &'static str) {
    trace!(
        target = "catalog.metrics",
        stage = stage,
        status = status,
        "job_transition_inc"
    );
}

pub fn throttled(class: &'static str) {
    trace!(
        target = "catalog.metrics",
        class = class,
        "admission_throttled_inc"
    );
}

pub fn gate_rejected(rule: &'static str) {
    trace!(
        target = "catalog.metrics",
        rule = rule,
        "gate_rejected_inc"
    );
}

pub fn publish_outcome(outcome: &'static str) {
    trace!(
        target = "catalog.metrics",
        outcome = outcome,
        "publish_outcome_inc"
    );
}
