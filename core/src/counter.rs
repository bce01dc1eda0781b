use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing u32 source for serial numbers and connection ids.
///
/// Starts at 1 and wraps back to 1, never yielding 0 so callers can use 0 as
/// an "unset" sentinel.
pub struct Counter(AtomicU32);

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Take the next value.
    pub fn next(&self) -> u32 {
        let mut cur = self.0.load(Ordering::Relaxed);
        loop {
            let next = if cur == u32::MAX { 1 } else { cur + 1 };
            match self.0.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return cur,
                Err(now) => cur = now,
            }
        }
    }

    /// The value the next call to [Counter::next] will return.
    #[inline]
    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_one() {
        let c = Counter::new();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.peek(), 3);
    }

    #[test]
    fn test_counter_wraps_to_one() {
        let c = Counter(AtomicU32::new(u32::MAX));
        assert_eq!(c.next(), u32::MAX);
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
    }
}
