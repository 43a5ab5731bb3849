use std::time::Instant;

/// Monotonic seconds since the clock was created. Copies share the origin.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    #[inline]
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_goes_back() {
        let clock = MonotonicClock::new();
        let copy = clock;

        let a = clock.now();
        let b = copy.now();
        let c = clock.now();
        assert!(a >= 0.0);
        assert!(b >= a);
        assert!(c >= b);
    }
}
