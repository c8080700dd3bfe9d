//! The progress-logging capability handed to long-running operations.

/// Progress sink for provisioning, scoring, redeploy and teardown.
///
/// Implementations must keep each call atomic — one call, one log line —
/// so interleaved workers never split a line. Error lines carry an
/// `ERROR:` prefix; the `done` event on the owning job is the actual
/// success/failure signal.
pub trait JobLogger: Send + Sync {
    fn status(&self, message: &str);
    fn error(&self, message: &str);
    fn success(&self, message: &str);
}
