//! Subscriber setup shared by the daemon and the CLI.
//!
//! Both binaries log through one `fmt` subscriber, human-readable or JSON
//! lines depending on `general.log_json`. Work runs inside a
//! [`process_span`] so every line says which service (and, for worker
//! invocations, which session) produced it.

use tracing_subscriber::{fmt, EnvFilter};

/// `RUST_LOG` when set, otherwise `default_level` (e.g. "info",
/// "as_daemon=debug,warn").
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with human-readable output.
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with JSON output, one object per line. Span fields
/// are flattened into each line's `spans` list.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_current_span(false)
        .with_span_list(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (json)");
}

/// Pick the output format from `general.log_json`.
pub fn init(service_name: &str, default_level: &str, json: bool) {
    if json {
        init_logging_json(service_name, default_level);
    } else {
        init_logging(service_name, default_level);
    }
}

/// Root span for one process. `session` is the worker session the process
/// acts for, when it was spawned as one.
pub fn process_span(service_name: &str, session: Option<&str>) -> tracing::Span {
    let span = tracing::info_span!(
        "process",
        service = service_name,
        session = tracing::field::Empty
    );
    if let Some(session) = session {
        span.record("session", session);
    }
    span
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn lines_inside_the_process_span_carry_service_and_session() {
        let text = capture(|| {
            let _entered = process_span("as", Some("developer-3f2a91c0")).entered();
            tracing::info!("task submitted for review");
        });
        assert!(text.contains("service=\"as\""), "{text}");
        assert!(text.contains("session=\"developer-3f2a91c0\""), "{text}");
    }

    #[test]
    fn operator_invocations_have_no_session_field() {
        let text = capture(|| {
            let _entered = process_span("as-daemon", None).entered();
            tracing::info!("sweep");
        });
        assert!(text.contains("service=\"as-daemon\""), "{text}");
        assert!(!text.contains("session="), "{text}");
    }
}
