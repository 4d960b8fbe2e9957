//! Resource-usage metrics.
//!
//! The backend reports what each spawned `git` cost. Shipping gauges to an
//! aggregator is deployment glue; this is only the interface, with a
//! log-backed sink as the default.
use turnip::request::Command;

use crate::git::ResourceUsage;

pub trait Sink: Send + Sync {
    fn gauge(&self, name: &str, value: f64);
}

/// Emits gauges to the log.
pub struct LogSink;

impl Sink for LogSink {
    fn gauge(&self, name: &str, value: f64) {
        tracing::info!(target: "metrics", "{name}={value}");
    }
}

/// Collapse anything an aggregator would choke on to `-`.
pub fn sanitize_repo_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out
}

/// Report one finished `git` invocation.
pub fn emit_resource_usage(
    sink: &dyn Sink,
    command: &Command,
    repository: &str,
    environment: &str,
    usage: &ResourceUsage,
) {
    let command = String::from_utf8_lossy(command.as_bytes()).into_owned();
    let repository = sanitize_repo_name(repository);
    for (metric, value) in [
        ("max_rss", usage.max_rss as f64),
        ("system_time", usage.system_time),
        ("user_time", usage.user_time),
    ] {
        sink.gauge(
            &format!(
                "git,operation={command},repo={repository},env={environment},metric={metric}"
            ),
            value,
        );
    }
}
