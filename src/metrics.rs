//! Run-scoped counters.
//!
//! A [`MetricsRegistry`] is created for each pipeline or batch run and handed
//! to the components that record into it. Concurrent runs never share one.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters for one run.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    requests_sent: AtomicU64,
    responses_routed: AtomicU64,
    server_errors: AtomicU64,
    unmatched_frames: AtomicU64,
    malformed_frames: AtomicU64,
    call_timeouts: AtomicU64,
    call_cancellations: AtomicU64,
    stages_run: AtomicU64,
    stage_retries: AtomicU64,
    stages_failed: AtomicU64,
    stages_skipped: AtomicU64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// A request was written to the server.
    RequestSent,
    /// A response was delivered to its caller.
    ResponseRouted,
    /// A response carried a JSON-RPC error.
    ServerError,
    /// A response id matched no pending call.
    UnmatchedFrame,
    /// A line on stdout was not a JSON-RPC frame.
    MalformedFrame,
    /// A call timed out.
    CallTimeout,
    /// A call was cancelled.
    CallCancelled,
    /// A stage attempt started.
    StageRun,
    /// A stage was retried.
    StageRetry,
    /// A stage finished unsuccessfully.
    StageFailed,
    /// A stage was skipped.
    StageSkipped,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `counter` by one.
    pub fn incr(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of `counter`.
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.slot(counter).load(Ordering::Relaxed)
    }

    /// Copies every counter into a serialisable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.get(Counter::RequestSent),
            responses_routed: self.get(Counter::ResponseRouted),
            server_errors: self.get(Counter::ServerError),
            unmatched_frames: self.get(Counter::UnmatchedFrame),
            malformed_frames: self.get(Counter::MalformedFrame),
            call_timeouts: self.get(Counter::CallTimeout),
            call_cancellations: self.get(Counter::CallCancelled),
            stages_run: self.get(Counter::StageRun),
            stage_retries: self.get(Counter::StageRetry),
            stages_failed: self.get(Counter::StageFailed),
            stages_skipped: self.get(Counter::StageSkipped),
        }
    }

    const fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::RequestSent => &self.requests_sent,
            Counter::ResponseRouted => &self.responses_routed,
            Counter::ServerError => &self.server_errors,
            Counter::UnmatchedFrame => &self.unmatched_frames,
            Counter::MalformedFrame => &self.malformed_frames,
            Counter::CallTimeout => &self.call_timeouts,
            Counter::CallCancelled => &self.call_cancellations,
            Counter::StageRun => &self.stages_run,
            Counter::StageRetry => &self.stage_retries,
            Counter::StageFailed => &self.stages_failed,
            Counter::StageSkipped => &self.stages_skipped,
        }
    }
}

/// Point-in-time copy of a [`MetricsRegistry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Requests written to the server.
    pub requests_sent: u64,
    /// Responses delivered to callers.
    pub responses_routed: u64,
    /// Responses carrying JSON-RPC errors.
    pub server_errors: u64,
    /// Responses with an unknown id.
    pub unmatched_frames: u64,
    /// Unparseable stdout lines.
    pub malformed_frames: u64,
    /// Calls that timed out.
    pub call_timeouts: u64,
    /// Calls that were cancelled.
    pub call_cancellations: u64,
    /// Stage attempts.
    pub stages_run: u64,
    /// Stage retries.
    pub stage_retries: u64,
    /// Failed stages.
    pub stages_failed: u64,
    /// Skipped stages.
    pub stages_skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_are_independent() {
        let a = MetricsRegistry::new();
        let b = MetricsRegistry::new();
        a.incr(Counter::RequestSent);
        a.incr(Counter::RequestSent);
        b.incr(Counter::StageSkipped);

        assert_eq!(a.get(Counter::RequestSent), 2);
        assert_eq!(b.get(Counter::RequestSent), 0);
        assert_eq!(b.snapshot().stages_skipped, 1);
    }
}
