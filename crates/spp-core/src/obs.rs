//! Structured observability hooks for SPP run lifecycle events.
//!
//! - A run-scoped tracing span via [`run_span`]
//! - Emission functions for run start/finish, request dispatch and cache hits

use tracing::{debug, info};

/// Span that scopes every event of one run.
///
/// ```ignore
/// async { /* evaluate */ }.instrument(run_span(&run_id, "summarize")).await
/// ```
pub fn run_span(run_id: &str, program: &str) -> tracing::Span {
    tracing::info_span!("spp.run", run_id = %run_id, program = %program)
}

/// Emit event: run started over `rows` input rows.
pub fn emit_run_started(run_id: &str, program: &str, rows: usize) {
    info!(event = "run.started", run_id = %run_id, program = %program, rows = rows);
}

/// Emit event: run finished with duration and failed-row count.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, rows: usize, failed: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        rows = rows,
        failed = failed,
    );
}

/// Emit event: run aborted (warning level).
pub fn emit_run_failed(run_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.failed", run_id = %run_id, error = %error);
}

/// Emit event: one request (carrying `lanes` lanes) sent by node `node`.
pub fn emit_request_dispatched(node: &str, lanes: usize, model: &str) {
    debug!(event = "request.dispatched", node = %node, lanes = lanes, model = %model);
}

/// Emit event: a request was answered from the response cache.
pub fn emit_cache_hit(key: &str, model: &str) {
    debug!(event = "cache.hit", key = %key, model = %model);
}

/// Emit event: lanes of node `node` failed (warning level).
pub fn emit_lanes_failed(node: &str, lanes: usize, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "node.lanes_failed", node = %node, lanes = lanes, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _entered = run_span("test-run-id", "test-program").entered();
        emit_run_started("test-run-id", "test-program", 2);
        emit_run_finished("test-run-id", 5, 2, 0);
    }
}
