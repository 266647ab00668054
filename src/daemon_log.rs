//! Shared diagnostic sink for daemon components.

use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Prefix carried by every administrator-facing diagnostic line.
pub const WARNING_PREFIX: &str = "Warning: <geopm-service>";

const SERVICE_TARGET: &str = "geopm_service";

/// Emits one human-readable warning line.
///
/// Used for every quarantine, denied write-lock request, close of a
/// nonexistent session and invalid access request. The line goes through
/// `tracing`; [`warning_layer`] writes it with nothing in front of the
/// prefix.
pub fn service_warning(msg: &str) {
    tracing::warn!(target: SERVICE_TARGET, "{}", format_warning(msg));
}

/// Debug logging utility for daemon components.
///
/// The `tag` parameter identifies the source module (e.g., "sessions",
/// "write_lock", "watcher") to aid debugging.
pub fn daemon_log(tag: &str, msg: &str) {
    tracing::debug!(target: SERVICE_TARGET, "[{}] {}", tag, msg);
}

pub fn format_warning(msg: &str) -> String {
    format!("{} {}", WARNING_PREFIX, msg)
}

/// Whether an event came from [`service_warning`].
pub fn is_service_warning(meta: &Metadata<'_>) -> bool {
    meta.target() == SERVICE_TARGET && *meta.level() == Level::WARN
}

/// Layer that prints service warnings bare: no timestamp, level or target.
pub fn warning_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter_fn(is_service_warning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::SubscriberExt;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for SharedBuf {
        type Writer = SharedBuf;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_format_warning_prefix() {
        let line = format_warning("Invalid signal name: BOGUS");
        assert_eq!(line, "Warning: <geopm-service> Invalid signal name: BOGUS");
    }

    #[test]
    fn test_warning_lines_start_with_prefix() {
        let buf = SharedBuf::default();
        let subscriber = tracing_subscriber::registry().with(warning_layer(buf.clone()));
        tracing::subscriber::with_default(subscriber, || {
            service_warning("Invalid signal name: BOGUS");
            daemon_log("sessions", "not a warning");
            tracing::warn!("warning from elsewhere");
            service_warning("Removing stale lock");
        });

        let output = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2, "{output}");
        assert!(lines.iter().all(|line| line.starts_with(WARNING_PREFIX)), "{output}");
        assert!(lines[0].ends_with("Invalid signal name: BOGUS"), "{output}");
    }
}
