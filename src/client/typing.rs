use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Rate limits outgoing typing signals: at most one `Start` per interval while
/// the user keeps typing, and a `Stop` only after a `Start` went out.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    interval: Duration,
    idle_after: Duration,
    last_start: Option<Instant>,
    last_input: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(interval: Duration, idle_after: Duration) -> Self {
        Self {
            interval,
            idle_after,
            last_start: None,
            last_input: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.last_start.is_some()
    }

    /// A keystroke. Returns `Start` when the peer should be (re)told.
    pub fn input(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_input = Some(now);
        match self.last_start {
            Some(at) if now.duration_since(at) < self.interval => None,
            _ => {
                self.last_start = Some(now);
                Some(TypingSignal::Start)
            }
        }
    }

    /// The draft was sent or cleared.
    pub fn stop(&mut self) -> Option<TypingSignal> {
        self.last_input = None;
        self.last_start.take().map(|_| TypingSignal::Stop)
    }

    /// Call periodically; emits `Stop` once input has been idle long enough.
    pub fn poll(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.last_input {
            Some(at) if now.duration_since(at) >= self.idle_after => self.stop(),
            _ => None,
        }
    }
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(5))
    }
}
