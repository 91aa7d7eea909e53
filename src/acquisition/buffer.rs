use crate::acquisition::error::AcquisitionError;

/// Every measurement of a run plus the binning used to display them.
#[derive(Clone, Debug)]
pub struct HistogramBuffer {
    samples: Vec<f64>,
    min: f64,
    max: f64,
    bins: usize,
}

impl HistogramBuffer {
    pub fn new(min: f64, max: f64, bins: usize) -> Result<Self, AcquisitionError> {
        check_binning(min, max, bins)?;
        Ok(Self {
            samples: Vec::new(),
            min,
            max,
            bins,
        })
    }

    pub fn push(&mut self, value: f64) {
        self.samples.push(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Changes the binning; existing samples are kept and re-binned on the next `counts`.
    pub fn set_binning(&mut self, min: f64, max: f64, bins: usize) -> Result<(), AcquisitionError> {
        check_binning(min, max, bins)?;
        self.min = min;
        self.max = max;
        self.bins = bins;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// `bins + 1` equally spaced edges from `min` to `max`.
    pub fn edges(&self) -> Vec<f64> {
        let width = (self.max - self.min) / self.bins as f64;
        (0..=self.bins)
            .map(|i| {
                if i == self.bins {
                    self.max
                } else {
                    self.min + i as f64 * width
                }
            })
            .collect()
    }

    /// Half-open bins except the last, which also takes `max`. Out-of-range and NaN are skipped.
    pub fn counts(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.bins];
        let width = (self.max - self.min) / self.bins as f64;
        for &v in &self.samples {
            if !(v >= self.min && v <= self.max) {
                continue;
            }
            let bin = (((v - self.min) / width) as usize).min(self.bins - 1);
            counts[bin] += 1;
        }
        counts
    }
}

fn check_binning(min: f64, max: f64, bins: usize) -> Result<(), AcquisitionError> {
    if !(min.is_finite() && max.is_finite() && min < max) {
        return Err(AcquisitionError::Configuration(format!(
            "histogram bounds [{min}, {max}] are empty"
        )));
    }
    if bins == 0 {
        return Err(AcquisitionError::Configuration(
            "histogram needs at least one bin".into(),
        ));
    }
    Ok(())
}

pub const INITIAL_AXIS_MAX: u64 = 50;
const GROW_FRACTION: f64 = 0.95;

/// Count axis that only ever grows, in steps that depend on its size.
#[derive(Clone, Debug)]
pub struct CountAxis {
    max: u64,
}

impl Default for CountAxis {
    fn default() -> Self {
        Self {
            max: INITIAL_AXIS_MAX,
        }
    }
}

impl CountAxis {
    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn step_for(max: u64) -> u64 {
        match max {
            0..=20 => 5,
            21..=50 => 10,
            51..=100 => 20,
            101..=250 => 25,
            251..=500 => 50,
            _ => 100,
        }
    }

    /// Grows until `tallest` is within 95% of the maximum. Returns whether it changed.
    pub fn grow_if_needed(&mut self, tallest: u64) -> bool {
        let before = self.max;
        while tallest as f64 > GROW_FRACTION * self.max as f64 {
            self.max += Self::step_for(self.max);
        }
        self.max != before
    }

    pub fn ticks(&self) -> Vec<u64> {
        let step = Self::step_for(self.max);
        (0..=self.max).step_by(step as usize).collect()
    }

    pub fn reset(&mut self) {
        self.max = INITIAL_AXIS_MAX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_match_equal_width_binning() {
        let mut h = HistogramBuffer::new(0.0, 10.0, 5).unwrap();
        for v in [0.0, 1.9, 2.0, 5.5, 9.99, 10.0, -0.1, 10.1, f64::NAN] {
            h.push(v);
        }
        assert_eq!(h.counts(), vec![2, 1, 1, 0, 2]);
        assert_eq!(h.edges(), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(h.len(), 9);
    }

    #[test]
    fn rebinning_keeps_samples() {
        let mut h = HistogramBuffer::new(0.0, 4.0, 4).unwrap();
        for v in [0.5, 1.5, 2.5, 3.5] {
            h.push(v);
        }
        h.set_binning(0.0, 4.0, 2).unwrap();
        assert_eq!(h.counts(), vec![2, 2]);
        assert!(h.set_binning(3.0, 3.0, 2).is_err());
        assert!(HistogramBuffer::new(0.0, 1.0, 0).is_err());
    }

    #[test]
    fn axis_grows_in_size_dependent_steps() {
        let mut axis = CountAxis::default();
        assert!(!axis.grow_if_needed(47));
        assert!(axis.grow_if_needed(48));
        assert_eq!(axis.max(), 60);
        assert_eq!(axis.ticks(), vec![0, 20, 40, 60]);

        axis.grow_if_needed(300);
        // 60 -> 80 -> 100 -> 120 -> 145 -> ... -> 320
        assert_eq!(axis.max(), 320);
        assert!(300.0 <= 0.95 * axis.max() as f64);
        assert_eq!(CountAxis::step_for(320), 50);
        assert_eq!(CountAxis::step_for(1000), 100);
    }
}
