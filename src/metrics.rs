use tracing::trace;

// Lightweight metrics helpers. Trace-based so builds without a recorder
// installed still surface the counters in logs.

pub fn job_claimed() {
    trace!(target: "talos.metrics", "jobs_claimed_inc");
}

pub fn job_completed(elapsed_ms: u128) {
    trace!(
        target: "talos.metrics",
        elapsed_ms = elapsed_ms as u64,
        "jobs_completed_inc"
    );
}

pub fn job_failed(stage: &'static str) {
    trace!(target: "talos.metrics", stage = stage, "jobs_failed_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target: "talos.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
