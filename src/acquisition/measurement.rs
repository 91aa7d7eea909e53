use log::warn;

use crate::acquisition::gate::Gate;
use crate::acquisition::waveform::Waveform;

/// Scalar derived from one capture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Measurement {
    /// Charge in pC; amplitude and peak-to-peak in mV.
    Charge {
        value: f64,
        amplitude: f64,
        peak_to_peak: f64,
    },
    /// Delay in ns between the open edges of two channels.
    TimeDifference { value: f64 },
    /// Delay in ns between the mid-points of two channel pairs.
    MeanDelay { value: f64 },
}

impl Measurement {
    /// The value that goes into the histogram.
    pub fn value(&self) -> f64 {
        match self {
            Measurement::Charge { value, .. }
            | Measurement::TimeDifference { value }
            | Measurement::MeanDelay { value } => *value,
        }
    }
}

/// Σ|v| over `[open, closed)` times `interval / resistance`. mV·ns/Ω gives pC.
pub fn integrate_charge(signal: &Waveform, gate: &Gate, resistance_ohms: f64) -> f64 {
    let end = gate.closed_index().min(signal.len());
    let start = gate.open_index().min(end);
    let sum: f64 = signal.values[start..end].iter().map(|v| v.abs()).sum();
    sum * signal.interval_ns / resistance_ohms
}

pub fn charge(signal: &Waveform, gate: &Gate, resistance_ohms: f64) -> Option<Measurement> {
    if gate.is_void() {
        return None;
    }
    let min = signal.min();
    let max = signal.max();
    // |min| - |max|, not max - min
    let (amplitude, peak_to_peak) = if signal.is_empty() {
        (0.0, 0.0)
    } else {
        (min.abs(), min.abs() - max.abs())
    };
    Some(Measurement::Charge {
        value: integrate_charge(signal, gate, resistance_ohms),
        amplitude,
        peak_to_peak,
    })
}

pub fn time_difference(a: &Gate, b: &Gate) -> Option<Measurement> {
    if !usable(&[*a, *b]) {
        return None;
    }
    Some(Measurement::TimeDifference {
        value: b.open_time() - a.open_time(),
    })
}

pub fn mean_delay(gates: &[Gate; 4]) -> Option<Measurement> {
    if !usable(gates) {
        return None;
    }
    let [a, b, c, d] = gates;
    let first = a.open_time() + (b.open_time() - a.open_time()) / 2.0;
    let second = c.open_time() + (d.open_time() - c.open_time()) / 2.0;
    Some(Measurement::MeanDelay {
        value: second - first,
    })
}

// false only when every gate is void
fn usable(gates: &[Gate]) -> bool {
    let void = gates.iter().filter(|g| g.is_void()).count();
    if void == gates.len() {
        return false;
    }
    if void > 0 {
        warn!(
            "{void} of {} gates saw no threshold crossing; using t = 0 for them",
            gates.len()
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::gate::{detect_gate, Crossing};
    use crate::types::Channel;

    fn found(time: f64) -> Gate {
        let index = time as usize;
        Gate {
            open: Crossing::Found {
                index,
                time,
                value: -20.0,
            },
            closed: Crossing::Found {
                index: index + 2,
                time: time + 2.0,
                value: -20.0,
            },
            extreme_index: index + 1,
        }
    }

    fn void() -> Gate {
        Gate {
            open: Crossing::NotFound,
            closed: Crossing::NotFound,
            extreme_index: 0,
        }
    }

    #[test]
    fn charge_of_symmetric_pulse() {
        let v = vec![0.0, -10.0, -20.0, -30.0, -40.0, -30.0, -20.0, -10.0, 0.0];
        let signal = Waveform::new(Channel::B, v, 1.0);
        let gate = detect_gate(&signal.values, &signal.times(), -20.0);
        let Some(Measurement::Charge {
            value,
            amplitude,
            peak_to_peak,
        }) = charge(&signal, &gate, 50.0)
        else {
            panic!("expected a charge measurement");
        };
        assert!((value - 2.4).abs() < 1e-12);
        assert_eq!(amplitude, 40.0);
        assert_eq!(peak_to_peak, 40.0);
    }

    #[test]
    fn void_gates_never_yield_zero() {
        let signal = Waveform::new(Channel::B, vec![1.0, 2.0, 3.0], 1.0);
        assert_eq!(charge(&signal, &void(), 50.0), None);
        assert_eq!(time_difference(&void(), &void()), None);
        assert_eq!(mean_delay(&[void(), void(), void(), void()]), None);

        let at_origin = Gate {
            open: Crossing::Found {
                index: 0,
                time: 0.0,
                value: 0.0,
            },
            closed: Crossing::Found {
                index: 0,
                time: 0.0,
                value: 0.0,
            },
            extreme_index: 0,
        };
        assert!(at_origin.is_void());
        assert_eq!(time_difference(&at_origin, &at_origin), None);
    }

    #[test]
    fn time_difference_subtracts_open_edges() {
        let m = time_difference(&found(3.0), &found(7.5)).unwrap();
        assert_eq!(m, Measurement::TimeDifference { value: 4.5 });
        // one void side falls back to t = 0
        let partial = time_difference(&void(), &found(7.0)).unwrap();
        assert_eq!(partial.value(), 7.0);
    }

    #[test]
    fn mean_delay_averages_pairs() {
        let gates = [found(2.0), found(4.0), found(10.0), found(14.0)];
        // mid1 = 3, mid2 = 12
        assert_eq!(mean_delay(&gates).unwrap().value(), 9.0);
    }
}
