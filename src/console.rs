//! Operator-facing output sink.

use parking_lot::Mutex;

/// Destination for load and unload reports.
pub trait OutputSink: Send + Sync {
    /// Write a message. Multi-line text is allowed.
    fn output(&self, text: &str);
}

/// Writes every line through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn output(&self, text: &str) {
        for line in text.lines() {
            tracing::info!(target: "modhost::console", "{}", line);
        }
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the captured lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Whether any captured line equals `line`.
    pub fn contains(&self, line: &str) -> bool {
        self.lines.lock().iter().any(|l| l == line)
    }

    /// Drop all captured lines.
    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl OutputSink for BufferSink {
    fn output(&self, text: &str) {
        let mut lines = self.lines.lock();
        lines.extend(text.lines().map(str::to_string));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_splits_lines() {
        let sink = BufferSink::new();
        sink.output("Load a.pkg");
        sink.output("first\nsecond");

        assert_eq!(sink.lines(), vec!["Load a.pkg", "first", "second"]);
        assert!(sink.contains("second"));

        sink.clear();
        assert!(sink.lines().is_empty());
    }
}
