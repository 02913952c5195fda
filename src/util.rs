//! Small helpers shared by the responders.

use std::time::Duration;
use tokio::time::Instant;

/// Deadline structure for budgeting the retry loops.  Built on the tokio
/// clock so a paused test runtime drives it deterministically.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a new budget now.
    pub fn after(budget: Duration) -> Self {
        Deadline {
            start: Instant::now(),
            budget,
        }
    }

    /// Remaining budget, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining().as_millis() as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Cap `wanted` so it never runs past the end of the budget.
    pub fn clamp(&self, wanted: Duration) -> Duration {
        wanted.min(self.remaining())
    }
}

/// Cut `text` to at most `max_chars` characters (not bytes).
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
