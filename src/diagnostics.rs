//! Diagnostic sink for events with no addressable caller.
//!
//! Decode failures, handler failures, transport hiccups and unknown
//! correlations never reach a `ResponseHandle`. They are logged, counted here,
//! and optionally forwarded to an application-supplied sink. Terminal
//! transitions of pending requests are counted too, which lets callers tell
//! "already answered" apart from "never existed" when investigating drops.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use log::{error, warn};

use crate::error::DispatchError;

const LOG_TARGET: &str = "azofly_bridge::diagnostics";

/// Counted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Resolved,
    Rejected,
    TimedOut,
    Cancelled,
    PublishFailure,
    UnknownCorrelation,
    DecodeFailure,
    HandlerFailure,
    BroadcastDelivered,
    UnhandledBroadcast,
    TransportError,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// Requests completed successfully.
    pub resolved: u64,
    /// Requests completed with a remote error.
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub publish_failures: u64,
    /// Responses whose `requestId` matched nothing pending.
    pub unknown_correlations: u64,
    pub decode_failures: u64,
    pub handler_failures: u64,
    pub broadcasts_delivered: u64,
    /// Messages with no `requestId` and no registered handler for their type.
    pub unhandled_broadcasts: u64,
    pub transport_errors: u64,
}

/// Callback receiving every `DispatchError` after it is logged.
pub struct DiagnosticSink(Box<dyn Fn(&DispatchError) + Send + Sync>);

impl DiagnosticSink {
    pub fn new(f: impl Fn(&DispatchError) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    fn emit(&self, err: &DispatchError) {
        (self.0)(err)
    }
}

/// Shared counters plus the optional sink.
#[derive(Default)]
pub struct Diagnostics {
    resolved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    publish_failures: AtomicU64,
    unknown_correlations: AtomicU64,
    decode_failures: AtomicU64,
    handler_failures: AtomicU64,
    broadcasts_delivered: AtomicU64,
    unhandled_broadcasts: AtomicU64,
    transport_errors: AtomicU64,
    sink: ArcSwapOption<DiagnosticSink>,
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("counters", &self.snapshot())
            .field("sink", &self.sink.load().is_some())
            .finish()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the sink. Takes effect for the next report.
    pub fn set_sink(&self, sink: DiagnosticSink) {
        self.sink.store(Some(Arc::new(sink)));
    }

    pub fn clear_sink(&self) {
        self.sink.store(None);
    }

    pub(crate) fn record(&self, event: Event) {
        self.counter(event).fetch_add(1, Ordering::Relaxed);
    }

    /// Log, count and forward an error nobody is waiting for.
    pub(crate) fn report(&self, err: &DispatchError) {
        match err {
            DispatchError::SubscriptionClosed { .. } => {
                error!(target: LOG_TARGET, "{}", err);
            }
            DispatchError::Decode(_) => {
                warn!(target: LOG_TARGET, "{}", err);
                self.record(Event::DecodeFailure);
            }
            DispatchError::HandlerFailed { .. } | DispatchError::HandlerPanicked { .. } => {
                warn!(target: LOG_TARGET, "{}", err);
                self.record(Event::HandlerFailure);
            }
            DispatchError::Transport(_) => {
                warn!(target: LOG_TARGET, "{}", err);
                self.record(Event::TransportError);
            }
        }

        if let Some(sink) = &*self.sink.load()
            && catch_unwind(AssertUnwindSafe(|| sink.emit(err))).is_err()
        {
            error!(target: LOG_TARGET, "Diagnostic sink panicked while reporting: {}", err);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            resolved: read(&self.resolved),
            rejected: read(&self.rejected),
            timed_out: read(&self.timed_out),
            cancelled: read(&self.cancelled),
            publish_failures: read(&self.publish_failures),
            unknown_correlations: read(&self.unknown_correlations),
            decode_failures: read(&self.decode_failures),
            handler_failures: read(&self.handler_failures),
            broadcasts_delivered: read(&self.broadcasts_delivered),
            unhandled_broadcasts: read(&self.unhandled_broadcasts),
            transport_errors: read(&self.transport_errors),
        }
    }

    fn counter(&self, event: Event) -> &AtomicU64 {
        match event {
            Event::Resolved => &self.resolved,
            Event::Rejected => &self.rejected,
            Event::TimedOut => &self.timed_out,
            Event::Cancelled => &self.cancelled,
            Event::PublishFailure => &self.publish_failures,
            Event::UnknownCorrelation => &self.unknown_correlations,
            Event::DecodeFailure => &self.decode_failures,
            Event::HandlerFailure => &self.handler_failures,
            Event::BroadcastDelivered => &self.broadcasts_delivered,
            Event::UnhandledBroadcast => &self.unhandled_broadcasts,
            Event::TransportError => &self.transport_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::Mutex;

    #[test]
    fn new_diagnostics_are_zeroed() {
        assert_eq!(Diagnostics::new().snapshot(), DiagnosticsSnapshot::default());
    }

    #[test]
    fn record_bumps_matching_counter_only() {
        let diagnostics = Diagnostics::new();
        diagnostics.record(Event::TimedOut);
        diagnostics.record(Event::TimedOut);
        diagnostics.record(Event::UnknownCorrelation);

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.timed_out, 2);
        assert_eq!(snapshot.unknown_correlations, 1);
        assert_eq!(snapshot.resolved, 0);
    }

    #[test]
    fn report_counts_by_error_kind() {
        let diagnostics = Diagnostics::new();
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();

        diagnostics.report(&DispatchError::Decode(decode));
        diagnostics.report(&DispatchError::HandlerPanicked {
            kind: "nav-event".into(),
        });
        diagnostics.report(&DispatchError::Transport(TransportError::Receive(
            "blip".into(),
        )));
        diagnostics.report(&DispatchError::SubscriptionClosed {
            channel: "responses".into(),
        });

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.handler_failures, 1);
        assert_eq!(snapshot.transport_errors, 1);
    }

    #[test]
    fn sink_receives_reported_errors_until_cleared() {
        let diagnostics = Diagnostics::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        diagnostics.set_sink(DiagnosticSink::new(move |err| {
            seen_clone.lock().unwrap().push(err.to_string());
        }));

        diagnostics.report(&DispatchError::HandlerFailed {
            kind: "t".into(),
            message: "boom".into(),
        });
        diagnostics.clear_sink();
        diagnostics.report(&DispatchError::HandlerPanicked { kind: "t".into() });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("boom"));
    }

    #[test]
    fn panicking_sink_does_not_escape_report() {
        let diagnostics = Diagnostics::new();
        diagnostics.set_sink(DiagnosticSink::new(|_| panic!("sink bug")));

        let decode = serde_json::from_str::<serde_json::Value>("garbage").unwrap_err();
        diagnostics.report(&DispatchError::Decode(decode));
        diagnostics.report(&DispatchError::HandlerPanicked { kind: "t".into() });

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.handler_failures, 1);
    }
}
