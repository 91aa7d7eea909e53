use crate::types::Channel;

/// One channel of a converted capture: values in mV, uniform spacing in ns.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    pub channel: Channel,
    pub values: Vec<f64>,
    pub interval_ns: f64,
}

impl Waveform {
    pub fn new(channel: Channel, values: Vec<f64>, interval_ns: f64) -> Self {
        Self {
            channel,
            values,
            interval_ns,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Time axis `0, dt, 2dt, ...`, the same length as `values`.
    pub fn times(&self) -> Vec<f64> {
        (0..self.values.len())
            .map(|i| i as f64 * self.interval_ns)
            .collect()
    }

    pub fn min(&self) -> f64 {
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn duration_ns(&self) -> f64 {
        self.values.len().saturating_sub(1) as f64 * self.interval_ns
    }
}
