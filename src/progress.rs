use serde::Serialize;

/// Per-test-case completion counters for a grading run.
///
/// `done` is monotonic within a run; an error only records a message and
/// leaves the counts alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            done: 0,
            total,
            message: None,
        }
    }

    /// Records completed test cases. A stale update never moves the counter
    /// backwards.
    pub fn update(&mut self, done: u64, total: u64) {
        self.done = self.done.max(done);
        self.total = total;
    }

    pub fn complete(&mut self) {
        self.done = self.total;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// Index of the test case currently being executed (1-based).
    pub fn current(&self) -> u64 {
        self.done + 1
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64 * 100.0
        }
    }
}
