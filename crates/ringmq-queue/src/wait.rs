use std::time::Duration;

/// How long a dequeue may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately.
    Poll,
    /// Block up to the given duration.
    For(Duration),
    /// Block until a packet arrives or the queue closes.
    Forever,
}

impl Wait {
    /// Interpret a millisecond timeout: `0` polls, negative waits forever.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Wait::Poll,
            ms if ms < 0 => Wait::Forever,
            ms => Wait::For(Duration::from_millis(ms as u64)),
        }
    }
}

impl From<Duration> for Wait {
    fn from(d: Duration) -> Self {
        if d.is_zero() { Wait::Poll } else { Wait::For(d) }
    }
}
