//! Access log: one event per inbound connection under the `access` target,
//! so it can be filtered apart from the rest of the log.

use std::fmt;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Accepted,
    Rejected,
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessStatus::Accepted => f.write_str("accepted"),
            AccessStatus::Rejected => f.write_str("rejected"),
        }
    }
}

/// Record that `from` asked for `to` and what became of it.
pub fn access(
    from: impl fmt::Display,
    to: impl fmt::Display,
    status: AccessStatus,
    reason: impl fmt::Display,
) {
    info!(
        target: "access",
        from = %from,
        to = %to,
        status = %status,
        reason = %reason,
        "access"
    );
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::FmtSubscriber;

    /// Log output collected by [`capture`]
    #[derive(Clone, Default)]
    pub struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        pub fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Route this thread's events into a buffer until the guard drops.
    /// Only sees events from tasks polled on the current thread.
    pub fn capture() -> (Captured, DefaultGuard) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (captured, tracing::subscriber::set_default(subscriber))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::capture;
    use super::*;

    #[test]
    fn test_access_line_fields() {
        let (captured, _guard) = capture();
        access("10.0.0.1:5000", "tcp:example.com:80", AccessStatus::Accepted, "");
        access("10.0.0.2:5000", "", AccessStatus::Rejected, "Invalid user");

        let text = captured.text();
        assert!(text.contains("access"));
        assert!(text.contains("from=10.0.0.1:5000"));
        assert!(text.contains("to=tcp:example.com:80"));
        assert!(text.contains("status=accepted"));
        assert!(text.contains("status=rejected"));
        assert!(text.contains("reason=Invalid user"));
    }
}
