//! Telemetry events for diff runs.
//!
//! One event when a run starts (the effective options) and one when it ends
//! (success flag, runtime, row counts, diff count, truncated error). Events
//! are structured JSON emitted through `tracing`; shipping them anywhere is
//! the embedding application's concern.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::differ::DiffOptions;

const MAX_ERROR_LEN: usize = 256;

pub(crate) fn send_start_event(options: &DiffOptions) {
    let event = json!({
        "event": "diff_start",
        "differ": "hashdiff",
        "bisection_factor": options.bisection_factor,
        "bisection_threshold": options.bisection_threshold,
        "bisection_disabled": options.bisection_disabled,
        "auto_bisection_factor": options.auto_bisection_factor,
        "segment_rows": options.segment_rows,
        "threaded": options.threaded,
        "max_threadpool_size": options.max_threadpool_size,
    });
    debug!(target: "tablediff::tracking", %event, "diff run started");
}

pub(crate) fn send_end_event(
    success: bool,
    runtime: Duration,
    rowcounts: Option<[u64; 2]>,
    diff_count: Option<u64>,
    error: Option<&str>,
) {
    let event = json!({
        "event": "diff_end",
        "success": success,
        "runtime_seconds": runtime.as_secs_f64(),
        "rows_a": rowcounts.map(|r| r[0]),
        "rows_b": rowcounts.map(|r| r[1]),
        "diff_count": diff_count,
        "error": error.map(truncate_error),
    });
    debug!(target: "tablediff::tracking", %event, "diff run finished");
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let truncated: String = error.chars().take(MAX_ERROR_LEN).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_errors_pass_through() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(1000);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_LEN + 3);
        assert!(truncated.ends_with("..."));
    }
}
