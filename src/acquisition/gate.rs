/// Sample nearest the threshold on one side of the pulse extreme.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Crossing {
    Found { index: usize, time: f64, value: f64 },
    NotFound,
}

impl Crossing {
    pub fn index(&self) -> Option<usize> {
        match self {
            Crossing::Found { index, .. } => Some(*index),
            Crossing::NotFound => None,
        }
    }

    pub fn time(&self) -> Option<f64> {
        match self {
            Crossing::Found { time, .. } => Some(*time),
            Crossing::NotFound => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Crossing::Found { value, .. } => Some(*value),
            Crossing::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Crossing::Found { .. })
    }
}

/// Open and closed crossings bracketing the most negative sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gate {
    pub open: Crossing,
    pub closed: Crossing,
    pub extreme_index: usize,
}

impl Gate {
    pub fn open_index(&self) -> usize {
        self.open.index().unwrap_or(0)
    }

    pub fn closed_index(&self) -> usize {
        self.closed.index().unwrap_or(self.extreme_index)
    }

    pub fn open_time(&self) -> f64 {
        self.open.time().unwrap_or(0.0)
    }

    pub fn closed_time(&self) -> f64 {
        self.closed.time().unwrap_or(0.0)
    }

    /// No usable crossing: nothing before the extreme, or both edges at t = 0.
    pub fn is_void(&self) -> bool {
        !self.open.is_found() || (self.open_time() == 0.0 && self.closed_time() == 0.0)
    }
}

/// Finds the samples nearest `threshold` before and after the minimum of `values`.
///
/// A candidate must be strictly closer to the threshold than the extreme sample itself,
/// so a record that never approaches the threshold reports `NotFound` on that side.
/// `times` is paired with `values` index by index.
pub fn detect_gate(values: &[f64], times: &[f64], threshold: f64) -> Gate {
    let len = values.len().min(times.len());
    if len == 0 {
        return Gate {
            open: Crossing::NotFound,
            closed: Crossing::NotFound,
            extreme_index: 0,
        };
    }
    let values = &values[..len];

    let mut extreme = 0;
    for (i, v) in values.iter().enumerate() {
        if *v < values[extreme] {
            extreme = i;
        }
    }

    let reference = (values[extreme] - threshold).abs();
    let nearest = |range: std::ops::Range<usize>| {
        let mut best = reference;
        let mut hit = Crossing::NotFound;
        for i in range {
            let diff = (values[i] - threshold).abs();
            if diff < best {
                best = diff;
                hit = Crossing::Found {
                    index: i,
                    time: times[i],
                    value: values[i],
                };
            }
        }
        hit
    };

    Gate {
        open: nearest(0..extreme),
        closed: nearest(extreme..len),
        extreme_index: extreme,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn symmetric_pulse_gates_at_threshold() {
        let v = [0.0, -10.0, -20.0, -30.0, -40.0, -30.0, -20.0, -10.0, 0.0];
        let gate = detect_gate(&v, &axis(v.len()), -20.0);
        assert_eq!(
            gate.open,
            Crossing::Found {
                index: 2,
                time: 2.0,
                value: -20.0
            }
        );
        assert_eq!(
            gate.closed,
            Crossing::Found {
                index: 6,
                time: 6.0,
                value: -20.0
            }
        );
        assert_eq!(gate.extreme_index, 4);
        assert!(!gate.is_void());
    }

    #[test]
    fn rising_record_has_no_open_crossing() {
        let v: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let gate = detect_gate(&v, &axis(v.len()), -20.0);
        assert_eq!(gate.extreme_index, 0);
        assert_eq!(gate.open, Crossing::NotFound);
        assert!(gate.is_void());
    }

    #[test]
    fn extreme_below_threshold_is_bracketed() {
        let v = [5.0, 3.0, -50.0, -80.0, -10.0, 2.0, 4.0];
        let gate = detect_gate(&v, &axis(v.len()), -30.0);
        assert!(gate.open_index() <= gate.extreme_index);
        assert!(gate.extreme_index <= gate.closed_index());
        assert_eq!(gate.open.index(), Some(2));
        assert_eq!(gate.closed.index(), Some(4));
    }

    #[test]
    fn index_zero_match_is_not_confused_with_missing() {
        let v = [-20.0, -5.0, -60.0, -5.0];
        let gate = detect_gate(&v, &axis(v.len()), -20.0);
        assert_eq!(gate.open.index(), Some(0));
        // open at t = 0 but the closed edge is later, so the capture is usable
        assert!(!gate.is_void());
    }

    #[test]
    fn flat_record_and_empty_input() {
        let v = [-3.0; 6];
        let gate = detect_gate(&v, &axis(6), -20.0);
        assert_eq!(gate.open, Crossing::NotFound);
        assert_eq!(gate.closed, Crossing::NotFound);
        assert_eq!(gate.closed_index(), gate.extreme_index);

        let empty = detect_gate(&[], &[], -20.0);
        assert_eq!(empty.extreme_index, 0);
        assert!(empty.is_void());
    }

    #[test]
    fn ordering_holds_for_assorted_records() {
        let records: [&[f64]; 4] = [
            &[1.0, -2.0, 3.0, -4.0, 5.0],
            &[-9.0, 0.0, 0.0],
            &[0.0, 0.0, -9.0],
            &[2.0, -1.0, -1.0, -1.0, 2.0],
        ];
        for v in records {
            for thr in [-10.0, -1.5, 0.0, 1.0] {
                let gate = detect_gate(v, &axis(v.len()), thr);
                assert!(gate.open_index() <= gate.extreme_index);
                assert!(gate.extreme_index <= gate.closed_index());
                assert!(gate.closed_index() < v.len());
            }
        }
    }
}
