/// Progress as `current_timestamp / total_duration`, never decreasing
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_us: i64,
    last: f32,
}

impl ProgressTracker {
    pub fn new(duration_us: i64) -> Self {
        Self { duration_us, last: 0.0 }
    }

    /// Fraction in [0, 1] for `timestamp_us`, or `None` when the duration is unknown
    pub fn update(&mut self, timestamp_us: i64) -> Option<f32> {
        if self.duration_us <= 0 {
            return None;
        }
        let fraction = (timestamp_us as f64 / self.duration_us as f64).clamp(0.0, 1.0) as f32;
        self.last = self.last.max(fraction);
        Some(self.last)
    }

    pub fn last(&self) -> f32 {
        self.last
    }
}
