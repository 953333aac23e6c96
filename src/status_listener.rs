//! ErrorListener / StatusCollector (C9): the one channel every stage
//! reports its first failure through.
//!
//! Grounded in `original_source/src/include/grpc_transcoding/
//! status_error_listener.h`: a single sticky first-error slot that
//! downstream code keeps consulting. Concentrating it here keeps each
//! pipeline stage's public methods infallible at the call site: a stage
//! either records a new error (if none is set yet) or silently no-ops,
//! and the `MessageStream` surfaces the final status once the upstream
//! has drained.

use tonic::Status;
use tracing::warn;

#[derive(Default)]
pub struct StatusListener {
    first_error: Option<Status>,
}

impl StatusListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `status` as the sticky error if none has been recorded yet.
    /// Later calls are ignored — the first non-ok status wins.
    pub fn set(&mut self, status: Status) {
        if self.first_error.is_none() {
            warn!(code = ?status.code(), message = %status.message(), "transcoding stage recorded a non-ok status");
            self.first_error = Some(status);
        }
    }

    pub fn is_ok(&self) -> bool {
        self.first_error.is_none()
    }

    pub fn status(&self) -> Status {
        self.first_error.clone().unwrap_or_else(Status::ok)
    }

    pub fn take(&mut self) -> Option<Status> {
        self.first_error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn first_error_is_sticky() {
        let mut listener = StatusListener::new();
        assert!(listener.is_ok());

        listener.set(Status::new(Code::InvalidArgument, "first"));
        listener.set(Status::new(Code::Internal, "second"));

        assert!(!listener.is_ok());
        assert_eq!(listener.status().code(), Code::InvalidArgument);
        assert_eq!(listener.status().message(), "first");
    }
}
