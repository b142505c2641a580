use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded FIFO of raw output lines. The oldest line is evicted on overflow.
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    /// A buffer holding at most `capacity` lines (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Lines currently held.
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Whether no line is held.
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Maximum number of lines.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every line.
    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_on_overflow() {
        let buffer = LogBuffer::new(1000);
        for i in 0..1001 {
            buffer.push(format!("line {i}"));
        }
        assert_eq!(buffer.len(), 1000);
        let all = buffer.tail(usize::MAX);
        assert_eq!(all.first().map(String::as_str), Some("line 1"));
        assert_eq!(all.last().map(String::as_str), Some("line 1000"));
    }

    #[test]
    fn test_tail_returns_most_recent_in_order() {
        let buffer = LogBuffer::new(10);
        for i in 0..5 {
            buffer.push(format!("{i}"));
        }
        assert_eq!(buffer.tail(2), vec!["3", "4"]);
        assert_eq!(buffer.tail(0), Vec::<String>::new());
        assert_eq!(buffer.tail(50).len(), 5);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = LogBuffer::new(0);
        buffer.push("a");
        buffer.push("b");
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.tail(5), vec!["b"]);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
