//! Progress reporting for long transfers.
//!
//! Engines report through a [`ProgressSink`]; rendering is left to the
//! caller. [`LogProgress`] writes debug log lines and [`NoProgress`] discards
//! everything.

use log::debug;

/// Receives progress updates from a transfer.
pub trait ProgressSink: Send {
    /// A transfer named `label` is starting; `total` is the expected unit
    /// count when known.
    fn start(&mut self, label: &str, total: Option<u64>);

    /// `delta` more units have been delivered.
    fn advance(&mut self, delta: u64);

    /// The transfer finished (successfully or not).
    fn finish(&mut self);
}

/// Discards all updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn start(&mut self, _label: &str, _total: Option<u64>) {}
    fn advance(&mut self, _delta: u64) {}
    fn finish(&mut self) {}
}

/// Emits `log::debug!` lines for each update.
#[derive(Debug, Default, Clone)]
pub struct LogProgress {
    label: String,
    total: Option<u64>,
    done: u64,
}

impl LogProgress {
    /// Units delivered so far.
    pub fn done(&self) -> u64 {
        self.done
    }
}

impl ProgressSink for LogProgress {
    fn start(&mut self, label: &str, total: Option<u64>) {
        self.label = label.to_string();
        self.total = total;
        self.done = 0;
        debug!("{label}: starting ({total:?} expected)");
    }

    fn advance(&mut self, delta: u64) {
        self.done += delta;
        match self.total {
            Some(total) => debug!("{}: {}/{}", self.label, self.done, total),
            None => debug!("{}: {}", self.label, self.done),
        }
    }

    fn finish(&mut self) {
        debug!("{}: finished after {}", self.label, self.done);
    }
}

/// Records every update; used by tests to assert on reporting.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingProgress {
    pub(crate) total: Option<u64>,
    pub(crate) updates: Vec<u64>,
    pub(crate) finished: bool,
}

#[cfg(test)]
impl ProgressSink for RecordingProgress {
    fn start(&mut self, _label: &str, total: Option<u64>) {
        self.total = total;
    }

    fn advance(&mut self, delta: u64) {
        self.updates.push(delta);
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}
