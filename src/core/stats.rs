//! Constant-memory running statistics for the temperature of one stage.

/// Welford accumulator over a stage's temperature samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for StageStats {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl StageStats {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation; zero when no samples were seen.
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_samples_match_population_statistics() {
        let mut stats = StageStats::default();
        for value in [100.0, 200.0, 300.0] {
            stats.update(value);
        }
        assert_eq!(stats.count(), 3);
        assert!((stats.mean() - 200.0).abs() < 1e-9);
        assert!((stats.std_dev() - 81.6497).abs() < 1e-3);
        assert_eq!(stats.min(), Some(100.0));
        assert_eq!(stats.max(), Some(300.0));
    }

    #[test]
    fn single_sample_has_zero_spread() {
        let mut stats = StageStats::default();
        stats.update(295.0);
        assert_eq!(stats.std_dev(), 0.0);
        assert_eq!(stats.mean(), 295.0);
    }

    #[test]
    fn empty_accumulator_reports_no_extremes() {
        let mut stats = StageStats::default();
        stats.update(10.0);
        stats.reset();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.std_dev(), 0.0);
        assert_eq!(stats.min(), None);
        assert_eq!(stats.max(), None);
        assert_eq!(stats, StageStats::default());
    }
}
