//! Metric names and descriptions.
//!
//! Every Prometheus metric is named here; modules call `metrics::counter!()`
//! and friends with these constants.
//!
//! # Naming
//!
//! - prefix: `instalog_`
//! - area: `plugin_`, `buffer_`, `output_`, `core_`
//! - suffix: `_total` (counter), `_seconds` (histogram), none (gauge)
//!
//! ```ignore
//! metrics::counter!(instalog_core::metrics::BUFFER_CORRUPT_RECORDS_TOTAL).increment(1);
//! ```

// ─── label keys ─────────────────────────────────────────────────────

/// Plugin id label
pub const LABEL_PLUGIN: &str = "plugin";

/// Outcome label (success, failure)
pub const LABEL_RESULT: &str = "result";

// ─── plugin data plane ──────────────────────────────────────────────

/// Events emitted by inputs (counter, label: plugin)
pub const EVENTS_EMITTED_TOTAL: &str = "instalog_plugin_events_emitted_total";

/// Events skipped by an output's flow policy (counter, label: plugin)
pub const EVENTS_FILTERED_TOTAL: &str = "instalog_plugin_events_filtered_total";

/// Events committed by outputs (counter, label: plugin)
pub const EVENTS_COMMITTED_TOTAL: &str = "instalog_plugin_events_committed_total";

/// Events returned for redelivery (counter, label: plugin)
pub const EVENTS_ABORTED_TOTAL: &str = "instalog_plugin_events_aborted_total";

/// Input lines dropped as malformed (counter, label: plugin)
pub const INPUT_LINES_DROPPED_TOTAL: &str = "instalog_plugin_input_lines_dropped_total";

/// Batches aborted for exceeding max_bytes (counter)
pub const BATCHES_OVERSIZE_TOTAL: &str = "instalog_output_batches_oversize_total";

/// Single events larger than max_bytes, committed without delivery (counter)
pub const EVENTS_DROPPED_OVERSIZE_TOTAL: &str = "instalog_output_events_dropped_oversize_total";

// ─── buffer ─────────────────────────────────────────────────────────

/// Records appended (counter)
pub const BUFFER_RECORDS_PRODUCED_TOTAL: &str = "instalog_buffer_records_produced_total";

/// Corrupt records skipped (counter)
pub const BUFFER_CORRUPT_RECORDS_TOTAL: &str = "instalog_buffer_corrupt_records_total";

/// Records removed by truncation (counter)
pub const BUFFER_TRUNCATED_RECORDS_TOTAL: &str = "instalog_buffer_truncated_records_total";

// ─── supervision ────────────────────────────────────────────────────

/// Errors returned from `main` (counter, label: plugin)
pub const PLUGIN_MAIN_ERRORS_TOTAL: &str = "instalog_plugin_main_errors_total";

/// Plugin restarts after a crash (counter, label: plugin)
pub const PLUGIN_RESTARTS_TOTAL: &str = "instalog_plugin_restarts_total";

/// Plugins currently up (gauge)
pub const CORE_PLUGINS_UP: &str = "instalog_core_plugins_up";

/// Flush duration (histogram, label: result)
pub const CORE_FLUSH_DURATION_SECONDS: &str = "instalog_core_flush_duration_seconds";

/// Daemon uptime (gauge)
pub const CORE_UPTIME_SECONDS: &str = "instalog_core_uptime_seconds";

/// Build information (gauge, always 1, label: version)
pub const CORE_BUILD_INFO: &str = "instalog_core_build_info";

// ─── histogram buckets ──────────────────────────────────────────────

/// Buckets for flush duration, in seconds.
pub const FLUSH_DURATION_BUCKETS: [f64; 9] = [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

// ─── descriptions ───────────────────────────────────────────────────

/// Registers descriptions for every metric. Call once after installing a recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(EVENTS_EMITTED_TOTAL, "Events emitted into the buffer by input plugins");
    describe_counter!(
        EVENTS_FILTERED_TOTAL,
        "Events skipped because an output's flow policy rejected them"
    );
    describe_counter!(EVENTS_COMMITTED_TOTAL, "Events committed by output plugins");
    describe_counter!(EVENTS_ABORTED_TOTAL, "Events returned to the buffer for redelivery");
    describe_counter!(INPUT_LINES_DROPPED_TOTAL, "Malformed input lines dropped");
    describe_counter!(
        BATCHES_OVERSIZE_TOTAL,
        "Output batches aborted for exceeding max_bytes"
    );
    describe_counter!(
        EVENTS_DROPPED_OVERSIZE_TOTAL,
        "Single events larger than max_bytes, dropped by outputs"
    );

    describe_counter!(BUFFER_RECORDS_PRODUCED_TOTAL, "Records appended to the buffer");
    describe_counter!(BUFFER_CORRUPT_RECORDS_TOTAL, "Corrupt buffer records skipped");
    describe_counter!(BUFFER_TRUNCATED_RECORDS_TOTAL, "Buffer records removed by truncation");

    describe_counter!(PLUGIN_MAIN_ERRORS_TOTAL, "Errors returned by plugin main loops");
    describe_counter!(PLUGIN_RESTARTS_TOTAL, "Plugin restarts after a crash");
    describe_gauge!(CORE_PLUGINS_UP, "Plugins currently in the UP state");
    describe_histogram!(CORE_FLUSH_DURATION_SECONDS, "Duration of flush requests in seconds");
    describe_gauge!(CORE_UPTIME_SECONDS, "Daemon uptime in seconds");
    describe_gauge!(CORE_BUILD_INFO, "Build information (always 1, with version label)");
}
