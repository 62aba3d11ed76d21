// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Last-write-wins snapshot of what a long operation is doing.
/// `total == 0` means indeterminate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStatus {
    pub label: String,
    pub current: i64,
    pub total: i64,
}

impl TaskStatus {
    pub fn indeterminate(&self) -> bool {
        self.total == 0
    }
}

/// Narrow reporting interface handed to long operations.
///
/// `interrupted` is polled cooperatively at every suspension point; operations
/// observing `true` must unwind with a cancellation error.
pub trait ProgressSink: Send + Sync {
    fn report(&self, label: &str, current: i64, total: i64);

    fn interrupted(&self) -> bool {
        false
    }
}

/// Sink that drops everything. Useful as a default and in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&self, _label: &str, _current: i64, _total: i64) {}
}

/// Publishes status snapshots to a `watch` channel and exposes a shared
/// cancellation flag. Single writer (the owning job task), any readers.
pub struct WatchSink {
    tx: watch::Sender<TaskStatus>,
    cancel: Arc<AtomicBool>,
}

impl WatchSink {
    pub fn new(tx: watch::Sender<TaskStatus>, cancel: Arc<AtomicBool>) -> Self {
        Self { tx, cancel }
    }
}

impl ProgressSink for WatchSink {
    fn report(&self, label: &str, current: i64, total: i64) {
        let current = if total > 0 { current.min(total) } else { current };
        let _ = self.tx.send(TaskStatus {
            label: label.to_string(),
            current,
            total,
        });
    }

    fn interrupted(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Maps an inner step's 0-100% onto a `[min,max]` slice of the parent sink so
/// that overall progress stays monotonic across heterogeneous steps.
///
/// Indeterminate inner reports (`total == 0`) are forwarded as the slice lower
/// bound so the label still reaches observers.
pub struct ScaledSink<'a> {
    parent: &'a dyn ProgressSink,
    min: i64,
    max: i64,
    high_water: AtomicI64,
}

impl<'a> ScaledSink<'a> {
    pub fn new(parent: &'a dyn ProgressSink, min: i64, max: i64) -> Self {
        debug_assert!(min <= max);
        Self {
            parent,
            min,
            max,
            high_water: AtomicI64::new(min),
        }
    }
}

impl ProgressSink for ScaledSink<'_> {
    fn report(&self, label: &str, current: i64, total: i64) {
        let scaled = if total > 0 {
            let current = current.clamp(0, total);
            self.min + (self.max - self.min) * current / total
        } else {
            self.min
        };
        let scaled = self.high_water.fetch_max(scaled, Ordering::Relaxed).max(scaled);
        self.parent.report(label, scaled.min(self.max), 100);
    }

    fn interrupted(&self) -> bool {
        self.parent.interrupted()
    }
}
