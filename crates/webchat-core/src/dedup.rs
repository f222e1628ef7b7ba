use std::collections::VecDeque;

/// Number of finalized incoming texts remembered for echo suppression.
pub const DEDUP_WINDOW_CAPACITY: usize = 5;

/// Bounded window of recently finalized incoming texts.
///
/// Used to drop server echoes of identical text arriving via parallel
/// delivery paths; the oldest entry is evicted on overflow.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    entries: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Whether an identical text was recently finalized.
    pub fn contains(&self, text: &str) -> bool {
        self.entries.iter().any(|entry| entry == text)
    }

    /// Record a finalized text, evicting the oldest entry on overflow.
    pub fn record(&mut self, text: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(text.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW_CAPACITY)
    }
}
