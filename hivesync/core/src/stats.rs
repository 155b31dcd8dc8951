//! Decaying averages used to grade endpoints.

/// Exponentially-weighted moving average with bias correction.
///
/// The average is `sum(decay^k * x_k) / sum(decay^k)` over all recorded samples, newest first, so
/// the very first sample is reported as-is instead of being dragged towards zero.
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    decay: f64,
    numerator: f64,
    denominator: f64,
}

impl Ewma {
    pub fn new(decay: f64) -> Self {
        Self {
            decay,
            numerator: 0.0,
            denominator: 0.0,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.numerator = self.decay * self.numerator + value;
        self.denominator = self.decay * self.denominator + 1.0;
    }

    /// Current average, or NaN when nothing has been recorded yet.
    pub fn get(&self) -> f64 {
        if self.denominator == 0.0 {
            return f64::NAN;
        }
        self.numerator / self.denominator
    }
}
