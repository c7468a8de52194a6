use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::Completion;
use crate::error::ChatError;
use crate::protocol::Usage;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// `RUST_LOG`, when set, overrides the configured level. Output goes to
/// stderr so streamed text on stdout stays clean.
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(tracing_level(&level)).unwrap_or_else(|_| EnvFilter::new("INFO"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn tracing_level(level: &str) -> &str {
    match level {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    }
}

/// Log the outcome of a stream that reached `Completed`.
///
/// Called inside the stream span, which carries `stream_id` and `model`.
pub fn log_stream_summary(completion: &Completion, elapsed: Duration) {
    info!(
        chunks = completion.chunks,
        skipped = completion.skipped,
        saw_sentinel = completion.saw_sentinel,
        duration_seconds = elapsed.as_secs_f64(),
        "stream completed"
    );
    if !completion.saw_sentinel {
        warn!("stream ended without [DONE] sentinel");
    }
}

/// Log the outcome of a stream that reached `Failed`.
pub fn log_stream_failed(error: &ChatError, elapsed: Duration) {
    warn!(
        category = ?error.category(),
        error = %error,
        duration_seconds = elapsed.as_secs_f64(),
        "stream failed"
    );
}

/// Log token usage reported by the backend.
pub fn log_usage(model: &str, usage: &Usage) {
    info!(
        model = model,
        input_tokens = usage.prompt_tokens,
        output_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        "token usage"
    );
}
