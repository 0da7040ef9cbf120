//! Moving averages and a least-squares estimator for the sizing policy

/// Samples after which the count-based warm-up weight stops applying
const OLD_THRESHOLD: u32 = 100;

/// Exponentially weighted moving average with a warm-up period.
///
/// While fewer than 100 samples have been taken, a sample is weighted at
/// least `100 / count` percent, so early averages track the data instead of
/// the initial zero.
#[derive(Debug, Clone)]
pub struct AdaptiveWeightedAverage {
    average: f64,
    sample_count: u32,
    weight: u32,
    last_sample: f64,
}

impl AdaptiveWeightedAverage {
    /// Average giving `weight` percent to each new sample
    pub fn new(weight: u32) -> Self {
        Self {
            average: 0.0,
            sample_count: 0,
            weight,
            last_sample: 0.0,
        }
    }

    /// Current average
    pub fn average(&self) -> f64 {
        self.average
    }

    /// Samples taken
    pub fn count(&self) -> u32 {
        self.sample_count
    }

    /// Most recent sample
    pub fn last_sample(&self) -> f64 {
        self.last_sample
    }

    /// Configured weight
    pub fn weight(&self) -> u32 {
        self.weight
    }

    fn is_old(&self) -> bool {
        self.sample_count >= OLD_THRESHOLD
    }

    /// `(100 - weight)% of avg + weight% of sample`
    pub fn exp_avg(avg: f64, sample: f64, weight: u32) -> f64 {
        let weight = weight as f64;
        (100.0 - weight) * avg / 100.0 + weight * sample / 100.0
    }

    fn compute_adaptive_average(&self, sample: f64, average: f64) -> f64 {
        let count_weight = if self.is_old() {
            0
        } else {
            OLD_THRESHOLD / self.sample_count.max(1)
        };
        Self::exp_avg(average, sample, self.weight.max(count_weight))
    }

    /// Fold in a sample
    pub fn sample(&mut self, value: f64) {
        self.sample_count = self.sample_count.saturating_add(1);
        self.average = self.compute_adaptive_average(value, self.average);
        self.last_sample = value;
    }

    /// Forget every sample
    pub fn clear(&mut self) {
        self.average = 0.0;
        self.sample_count = 0;
        self.last_sample = 0.0;
    }
}

/// Weighted average plus a padded average `average + padding * deviation`
#[derive(Debug, Clone)]
pub struct AdaptivePaddedAverage {
    inner: AdaptiveWeightedAverage,
    padded_average: f64,
    deviation: f64,
    padding: u32,
    /// Zero samples leave the deviation untouched
    no_zero_deviation: bool,
}

impl AdaptivePaddedAverage {
    /// Padded average with `padding` deviations of headroom
    pub fn new(weight: u32, padding: u32) -> Self {
        Self {
            inner: AdaptiveWeightedAverage::new(weight),
            padded_average: 0.0,
            deviation: 0.0,
            padding,
            no_zero_deviation: false,
        }
    }

    /// Variant whose deviation ignores zero samples, for quantities (like
    /// promoted words) that are legitimately zero on some cycles
    pub fn no_zero_deviation(weight: u32, padding: u32) -> Self {
        Self {
            no_zero_deviation: true,
            ..Self::new(weight, padding)
        }
    }

    /// Fold in a sample
    pub fn sample(&mut self, value: f64) {
        self.inner.sample(value);
        let average = self.inner.average();
        if !(self.no_zero_deviation && value == 0.0) {
            self.deviation = self
                .inner
                .compute_adaptive_average((value - average).abs(), self.deviation);
        }
        self.padded_average = average + self.padding as f64 * self.deviation;
    }

    /// Plain average
    pub fn average(&self) -> f64 {
        self.inner.average()
    }

    /// Average plus padding
    pub fn padded_average(&self) -> f64 {
        self.padded_average
    }

    /// Mean absolute deviation
    pub fn deviation(&self) -> f64 {
        self.deviation
    }

    /// Samples taken
    pub fn count(&self) -> u32 {
        self.inner.count()
    }

    /// Most recent sample
    pub fn last_sample(&self) -> f64 {
        self.inner.last_sample()
    }
}

/// Least-squares line `y = intercept + slope * x` over every sample
#[derive(Debug, Clone)]
pub struct LinearLeastSquareFit {
    sum_x: f64,
    sum_x_squared: f64,
    sum_y: f64,
    sum_xy: f64,
    intercept: f64,
    slope: f64,
    mean_x: AdaptiveWeightedAverage,
    mean_y: AdaptiveWeightedAverage,
}

impl LinearLeastSquareFit {
    /// Empty fit; `weight` applies to the tracked means
    pub fn new(weight: u32) -> Self {
        Self {
            sum_x: 0.0,
            sum_x_squared: 0.0,
            sum_y: 0.0,
            sum_xy: 0.0,
            intercept: 0.0,
            slope: 0.0,
            mean_x: AdaptiveWeightedAverage::new(weight),
            mean_y: AdaptiveWeightedAverage::new(weight),
        }
    }

    /// Add a point and refit
    pub fn update(&mut self, x: f64, y: f64) {
        self.sum_x += x;
        self.sum_x_squared += x * x;
        self.sum_y += y;
        self.sum_xy += x * y;
        self.mean_x.sample(x);
        self.mean_y.sample(y);

        let n = self.mean_x.count() as f64;
        if self.mean_x.count() > 1 {
            let denominator = n * self.sum_x_squared - self.sum_x * self.sum_x;
            if denominator != 0.0 {
                self.slope = (n * self.sum_xy - self.sum_x * self.sum_y) / denominator;
                self.intercept = (self.sum_y - self.slope * self.sum_x) / n;
            }
        }
    }

    /// Predicted `y` at `x` (0 before any sample)
    pub fn y(&self, x: f64) -> f64 {
        if self.mean_x.count() == 0 {
            0.0
        } else {
            self.intercept + self.slope * x
        }
    }

    /// Fitted slope
    pub fn slope(&self) -> f64 {
        self.slope
    }

    /// Fitted intercept
    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    /// Points added
    pub fn count(&self) -> u32 {
        self.mean_x.count()
    }

    /// Whether shrinking `x` is predicted to lower `y`
    pub fn decrement_will_decrease(&self) -> bool {
        self.slope >= 0.0
    }

    /// Whether growing `x` is predicted to lower `y`
    pub fn increment_will_decrease(&self) -> bool {
        self.slope <= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_sample_is_average() {
        let mut avg = AdaptiveWeightedAverage::new(10);
        avg.sample(8.0);
        assert!(close(avg.average(), 8.0));
        // second sample weighted 50%
        avg.sample(4.0);
        assert!(close(avg.average(), 6.0));
        assert_eq!(avg.count(), 2);
        assert!(close(avg.last_sample(), 4.0));
    }

    #[test]
    fn test_weight_floor_after_warm_up() {
        let mut avg = AdaptiveWeightedAverage::new(10);
        for _ in 0..100 {
            avg.sample(1.0);
        }
        avg.sample(11.0);
        // weight 10%: 0.9 * 1 + 0.1 * 11
        assert!(close(avg.average(), 2.0));
    }

    #[test]
    fn test_padded_average() {
        let mut avg = AdaptivePaddedAverage::new(10, 2);
        avg.sample(10.0);
        assert!(close(avg.deviation(), 0.0));
        assert!(close(avg.padded_average(), 10.0));
        avg.sample(20.0);
        // average 15, deviation 50% of |20 - 15| = 2.5
        assert!(close(avg.average(), 15.0));
        assert!(close(avg.deviation(), 2.5));
        assert!(close(avg.padded_average(), 20.0));
    }

    #[test]
    fn test_no_zero_deviation_ignores_zeros() {
        let mut plain = AdaptivePaddedAverage::new(10, 3);
        let mut no_zero = AdaptivePaddedAverage::no_zero_deviation(10, 3);
        for value in [6.0, 0.0, 0.0] {
            plain.sample(value);
            no_zero.sample(value);
        }
        assert!(close(no_zero.deviation(), 0.0));
        assert!(plain.deviation() > 0.0);
        assert!(close(plain.average(), no_zero.average()));
    }

    #[test]
    fn test_least_squares_exact_line() {
        let mut fit = LinearLeastSquareFit::new(10);
        assert!(close(fit.y(5.0), 0.0));
        for x in 1..=5 {
            let x = x as f64;
            fit.update(x, 3.0 + 2.0 * x);
        }
        assert!(close(fit.slope(), 2.0));
        assert!(close(fit.intercept(), 3.0));
        assert!(close(fit.y(10.0), 23.0));
        assert!(fit.decrement_will_decrease());
        assert!(!fit.increment_will_decrease());
    }
}
