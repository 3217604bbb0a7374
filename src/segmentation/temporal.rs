//! Per-run temporal state for the person strategy
//!
//! Both pieces live in an explicit [`PipelineState`] owned by the strategy
//! instance, so independent processors never share smoothing history.

use crate::frame::SegmentationMask;

/// Coefficients at or above this value disable the extra smoothing
pub const EMA_DISABLED_THRESHOLD: f32 = 0.99;

/// Exponential moving average across consecutive masks
///
/// `smoothed = alpha * current + (1 - alpha) * previous`
#[derive(Debug, Clone)]
pub struct TemporalMaskFilter {
    alpha: f32,
    previous: Option<SegmentationMask>,
}

impl TemporalMaskFilter {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            previous: None,
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: f32) {
        self.alpha = alpha.clamp(0.0, 1.0);
        tracing::debug!("EMA alpha set to {}", self.alpha);
    }

    pub fn is_enabled(&self) -> bool {
        self.alpha < EMA_DISABLED_THRESHOLD
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }

    /// Blend `current` with the retained mask and retain the result.
    /// The first mask, a disabled filter, or a resolution change pass `current` through.
    pub fn apply(&mut self, current: SegmentationMask) -> SegmentationMask {
        let smoothed = match &self.previous {
            Some(previous) if self.is_enabled() && previous.same_size(&current) => {
                let alpha = self.alpha;
                let values = current
                    .values
                    .iter()
                    .zip(&previous.values)
                    .map(|(&c, &p)| (alpha * c + (1.0 - alpha) * p).clamp(0.0, 1.0))
                    .collect();
                SegmentationMask::new(current.width, current.height, values)
            }
            _ => current,
        };
        self.previous = Some(smoothed.clone());
        smoothed
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Forces strictly increasing timestamps
#[derive(Debug, Clone, Default)]
pub struct MonotonicTimestamps {
    last: Option<i64>,
}

impl MonotonicTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective timestamp for `source_us`: unchanged if it is later than the
    /// last one emitted, otherwise `last + 1`
    pub fn next(&mut self, source_us: i64) -> i64 {
        let effective = match self.last {
            Some(last) if source_us <= last => last + 1,
            _ => source_us,
        };
        self.last = Some(effective);
        effective
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Smoothing and timestamp state for one processing run
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub filter: TemporalMaskFilter,
    pub timestamps: MonotonicTimestamps,
}

impl PipelineState {
    pub fn new(ema_alpha: f32) -> Self {
        Self {
            filter: TemporalMaskFilter::new(ema_alpha),
            timestamps: MonotonicTimestamps::new(),
        }
    }

    /// Clear the retained mask and the timestamp counter
    pub fn reset(&mut self) {
        self.filter.reset();
        self.timestamps.reset();
    }
}
