use std::time::Duration;

use crate::circular_queue::CircularQueue;

/// Average rate over the last `window` cycles.
#[derive(Debug, Clone)]
pub struct FpsCounter {
    rates: CircularQueue<f64>,
}

impl FpsCounter {
    pub fn new(window: usize) -> Self {
        Self {
            rates: CircularQueue::with_capacity(window),
        }
    }

    /// Records one cycle that took `frame_time`.
    pub fn record(&mut self, frame_time: Duration) {
        let secs = frame_time.as_secs_f64();
        self.rates.push(if secs > 0.0 { 1.0 / secs } else { 0.0 });
    }

    pub fn fps(&self) -> f64 {
        if self.rates.is_empty() {
            return 0.0;
        }

        self.rates.iter().sum::<f64>() / self.rates.len() as f64
    }
}

/// Snapshot of pipeline throughput, copied out to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub display_fps: f64,
    pub inference_fps: f64,
    pub last_inference_ms: f64,
    pub frames_captured: u64,
    pub inference_cycles: u64,
    pub detector_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_counter() {
        assert_eq!(FpsCounter::new(10).fps(), 0.0);
    }

    #[test]
    fn test_average_over_window() {
        let mut counter = FpsCounter::new(2);
        counter.record(Duration::from_millis(1000));
        counter.record(Duration::from_millis(100));
        assert!((counter.fps() - 5.5).abs() < 1e-9);

        // first sample falls out of the window
        counter.record(Duration::from_millis(100));
        assert!((counter.fps() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_frame_time() {
        let mut counter = FpsCounter::new(4);
        counter.record(Duration::ZERO);
        assert_eq!(counter.fps(), 0.0);
    }
}
