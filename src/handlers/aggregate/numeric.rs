//! Numerically stable accumulators for float aggregation

/// Welford's online mean
///
/// Stays stable where a running sum divided by the count would overflow or
/// lose precision.
#[derive(Debug, Clone, Default)]
pub struct WelfordMean {
    /// Number of values seen
    count: u64,
    /// Running mean
    mean: f64,
}

impl WelfordMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value to the computation
    #[inline]
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    /// Current mean, `None` before the first value
    #[inline]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Merge another partial mean into this one
    pub fn merge(&mut self, other: &WelfordMean) {
        if other.count == 0 {
            return;
        }
        let combined = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * (other.count as f64 / combined as f64);
        self.count = combined;
    }
}

/// Kahan summation for accurate floating-point sums
#[derive(Debug, Clone, Default)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
    count: u64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value to the sum
    #[inline]
    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
        self.count += 1;
    }

    /// Current sum, `None` before the first value
    #[inline]
    pub fn sum(&self) -> Option<f64> {
        (self.count > 0).then_some(self.sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_mean() {
        let mut state = WelfordMean::new();
        assert_eq!(state.mean(), None);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            state.add(v);
        }
        assert!((state.mean().unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_welford_merge() {
        let mut left = WelfordMean::new();
        [2.0, 4.0, 4.0, 4.0].iter().for_each(|&v| left.add(v));
        let mut right = WelfordMean::new();
        [5.0, 5.0, 7.0, 9.0].iter().for_each(|&v| right.add(v));

        left.merge(&right);
        assert!((left.mean().unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_welford_large_values() {
        let mut state = WelfordMean::new();
        state.add(f64::MAX);
        state.add(f64::MAX);
        assert_eq!(state.mean(), Some(f64::MAX));
    }

    #[test]
    fn test_kahan_sum_accuracy() {
        let mut kahan = KahanSum::new();
        let mut naive = 0.0;

        kahan.add(1e15);
        naive += 1e15;
        for _ in 0..100_000 {
            kahan.add(0.1);
            naive += 0.1;
        }

        let expected = 1e15 + 10_000.0;
        let kahan_error = (kahan.sum().unwrap() - expected).abs();
        let naive_error = (naive - expected).abs();
        assert!(kahan_error <= naive_error);
    }

    #[test]
    fn test_empty_sum() {
        assert_eq!(KahanSum::new().sum(), None);
    }
}
