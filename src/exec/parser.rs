// SPDX-License-Identifier: AGPL-3.0-only

use crate::progress::ProgressSink;

/// Injected strategy that extracts progress from worker output lines.
///
/// The runner knows nothing about any worker's log format; a parser variant
/// per worker kind recognizes its own markers and reports through the sink.
pub trait LineParser: Send {
    fn parse_line(&mut self, line: &str, sink: &dyn ProgressSink);
}

/// Ignores all output.
#[derive(Debug, Default)]
pub struct NullParser;

impl LineParser for NullParser {
    fn parse_line(&mut self, _line: &str, _sink: &dyn ProgressSink) {}
}

/// Recognizes `<marker> <current>/<total>` progress lines, e.g. the worker
/// printing `processing tile 3/40`.
#[derive(Debug)]
pub struct UnitProgressParser {
    marker: String,
    label: String,
}

impl UnitProgressParser {
    pub fn new(marker: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            label: label.into(),
        }
    }
}

impl LineParser for UnitProgressParser {
    fn parse_line(&mut self, line: &str, sink: &dyn ProgressSink) {
        let Some(rest) = line.trim().strip_prefix(self.marker.as_str()) else {
            return;
        };
        let Some((current, total)) = parse_ratio(rest) else {
            return;
        };
        sink.report(&self.label, current, total);
    }
}

fn parse_ratio(rest: &str) -> Option<(i64, i64)> {
    let (current, total) = rest.trim().split_once('/')?;
    let current: i64 = current.trim().parse().ok()?;
    let total: i64 = total.trim().parse().ok()?;
    if current < 0 || total < 0 {
        return None;
    }
    Some((current, total))
}
