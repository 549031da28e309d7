//! Throttled progress emission toward the client.

use std::time::{Duration, Instant};

use log::warn;

use crate::protocol::{encode_progress, ProgressKind};
use crate::transport::Stream;

/// Cadence of timer-driven progress frames.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Emits progress frames, suppressing duplicates of `(kind, now)` and
/// rate-limiting the periodic ones. Delivery is best-effort: a frame that
/// cannot be flushed is logged and forgotten, never failed on.
pub struct ProgressReporter {
    interval: Duration,
    last_sent: Option<(ProgressKind, i64)>,
    last_emit: Option<Instant>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_interval(PROGRESS_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            last_emit: None,
        }
    }

    /// Timer-driven emission: at most one frame per interval.
    pub fn tick(&mut self, out: &mut dyn Stream, kind: ProgressKind, now: i64, total: i64) {
        if let Some(last) = self.last_emit {
            if last.elapsed() < self.interval {
                return;
            }
        }
        self.send(out, kind, now, total);
    }

    /// Unthrottled emission for the start and completion frames. Duplicate
    /// suppression still applies.
    pub fn force(&mut self, out: &mut dyn Stream, kind: ProgressKind, now: i64, total: i64) {
        self.send(out, kind, now, total);
    }

    fn send(&mut self, out: &mut dyn Stream, kind: ProgressKind, now: i64, total: i64) {
        if self.last_sent == Some((kind, now)) {
            return;
        }
        self.last_sent = Some((kind, now));
        self.last_emit = Some(Instant::now());

        let frame = encode_progress(kind, now, total);
        if let Err(e) = out.write_all(&frame) {
            warn!("progress frame not written: {e}");
            return;
        }
        if let Err(e) = out.flush() {
            warn!("progress frame not flushed: {e}");
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
