use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::acquisition::device::{
    mv_to_adc, ChannelSetup, DeviceStatus, RawCapture, Resolution, ScopeDevice, Timebase,
    TriggerSpec, DEFAULT_MAX_ADC,
};
use crate::types::Channel;

/// Arrival delay of the pulse on each channel, in ns.
pub const DEFAULT_DELAYS_NS: [f64; 4] = [0.0, 1.0, 8.0, 9.0];

#[derive(Clone, Copy, Debug)]
struct Failure {
    step: &'static str,
    nth_call: u32,
    status: DeviceStatus,
}

/// Pulse parameters of the generated records.
#[derive(Clone, Debug)]
pub struct PulseShape {
    pub amplitude_mv: (f64, f64),
    pub sigma_ns: f64,
    pub noise_mv: f64,
    pub jitter_ns: f64,
}

impl Default for PulseShape {
    fn default() -> Self {
        Self {
            amplitude_mv: (150.0, 400.0),
            sigma_ns: 2.0,
            noise_mv: 4.0,
            jitter_ns: 0.3,
        }
    }
}

/// Stop and close counts that stay readable after the scope has moved into a run.
#[derive(Clone, Debug, Default)]
pub struct ReleaseCounter {
    stops: Arc<AtomicU32>,
    closes: Arc<AtomicU32>,
}

impl ReleaseCounter {
    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

/// In-process digitizer producing negative pulses, or replaying scripted records.
pub struct SimulatedScope {
    rng: StdRng,
    open: bool,
    channels: [Option<ChannelSetup>; 4],
    trigger: Option<TriggerSpec>,
    max_adc: i16,
    interval_ns: f64,
    shape: PulseShape,
    delays_ns: [f64; 4],
    timeout_ratio: f64,
    ready_after: u32,
    polls_left: u32,
    record_len: usize,
    bound: Vec<(Channel, usize)>,
    pending: Option<RawCapture>,
    script: Option<VecDeque<RawCapture>>,
    failures: Vec<Failure>,
    calls: HashMap<&'static str, u32>,
    released: ReleaseCounter,
}

impl SimulatedScope {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            open: false,
            channels: Default::default(),
            trigger: None,
            max_adc: DEFAULT_MAX_ADC,
            interval_ns: 0.4,
            shape: PulseShape::default(),
            delays_ns: DEFAULT_DELAYS_NS,
            timeout_ratio: 0.0,
            ready_after: 1,
            polls_left: 0,
            record_len: 0,
            bound: Vec::new(),
            pending: None,
            script: None,
            failures: Vec::new(),
            calls: HashMap::new(),
            released: ReleaseCounter::default(),
        }
    }

    /// Replays `records` in order; once exhausted every capture is flat.
    pub fn scripted(records: impl IntoIterator<Item = RawCapture>) -> Self {
        let mut scope = Self::new(0);
        scope.script = Some(records.into_iter().collect());
        scope
    }

    /// Fraction of captures that auto-trigger on noise alone.
    pub fn with_timeout_ratio(mut self, ratio: f64) -> Self {
        self.timeout_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_delays_ns(mut self, delays_ns: [f64; 4]) -> Self {
        self.delays_ns = delays_ns;
        self
    }

    pub fn with_shape(mut self, shape: PulseShape) -> Self {
        self.shape = shape;
        self
    }

    /// Number of `is_ready` polls before a capture completes.
    pub fn with_ready_after(mut self, polls: u32) -> Self {
        self.ready_after = polls.max(1);
        self
    }

    /// Makes the `nth_call` (1-based) call of `step` return `status`.
    pub fn fail_at(mut self, step: &'static str, nth_call: u32, status: DeviceStatus) -> Self {
        self.failures.push(Failure {
            step,
            nth_call,
            status,
        });
        self
    }

    pub fn stop_calls(&self) -> u32 {
        self.released.stops()
    }

    pub fn close_calls(&self) -> u32 {
        self.released.closes()
    }

    pub fn release_counter(&self) -> ReleaseCounter {
        self.released.clone()
    }

    pub fn calls(&self, step: &str) -> u32 {
        self.calls.get(step).copied().unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn trigger(&self) -> Option<&TriggerSpec> {
        self.trigger.as_ref()
    }

    fn step(&mut self, name: &'static str) -> DeviceStatus {
        let count = self.calls.entry(name).or_insert(0);
        *count += 1;
        let nth = *count;
        if let Some(failure) = self
            .failures
            .iter()
            .find(|f| f.step == name && f.nth_call == nth)
        {
            debug!("simulated {name} call {nth} fails with {}", failure.status);
            return failure.status;
        }
        if name != "open" && !self.open {
            return DeviceStatus::INVALID_HANDLE;
        }
        DeviceStatus::OK
    }

    fn interval_for(timebase: u32) -> f64 {
        if timebase < 5 {
            0.2 * f64::from(1u32 << timebase)
        } else {
            f64::from(timebase - 4) * 6.4
        }
    }

    fn generate(&mut self, pre: usize, len: usize) -> RawCapture {
        let triggered = self.rng.gen::<f64>() >= self.timeout_ratio;
        let amplitude = self
            .rng
            .gen_range(self.shape.amplitude_mv.0..=self.shape.amplitude_mv.1);
        let jitter = self.shape.jitter_ns;
        let onset = pre as f64 * self.interval_ns + 3.0 * self.shape.sigma_ns;

        let mut buffers = Vec::new();
        for ch in Channel::ALL {
            let Some(setup) = self.channels[ch.index()].clone() else {
                continue;
            };
            let centre = onset + self.delays_ns[ch.index()] + self.rng.gen_range(-jitter..=jitter);
            let offset_mv = setup.analog_offset_v * 1000.0;
            let samples = (0..len)
                .map(|i| {
                    let t = i as f64 * self.interval_ns;
                    let noise = self.rng.gen_range(-self.shape.noise_mv..=self.shape.noise_mv);
                    let pulse = if triggered {
                        let z = (t - centre) / self.shape.sigma_ns;
                        -amplitude * (-0.5 * z * z).exp()
                    } else {
                        0.0
                    };
                    mv_to_adc(pulse + noise + offset_mv, setup.range_mv, self.max_adc)
                })
                .collect();
            buffers.push((ch, samples));
        }
        RawCapture {
            sample_count: len,
            overflow: 0,
            buffers,
        }
    }
}

impl ScopeDevice for SimulatedScope {
    fn open(&mut self, _resolution: Resolution) -> DeviceStatus {
        let status = self.step("open");
        if status.is_ok() {
            self.open = true;
        }
        status
    }

    fn set_channel(&mut self, channel: Channel, setup: Option<&ChannelSetup>) -> DeviceStatus {
        let status = self.step("set_channel");
        if status.is_ok() {
            self.channels[channel.index()] = setup.cloned();
        }
        status
    }

    fn max_adc(&mut self, _resolution: Resolution) -> Result<i16, DeviceStatus> {
        let status = self.step("max_adc");
        if status.is_ok() {
            Ok(self.max_adc)
        } else {
            Err(status)
        }
    }

    fn set_trigger(&mut self, trigger: &TriggerSpec) -> DeviceStatus {
        let status = self.step("set_trigger");
        if status.is_ok() {
            self.trigger = Some(trigger.clone());
        }
        status
    }

    fn minimum_timebase(
        &mut self,
        enabled_mask: u32,
        _resolution: Resolution,
    ) -> Result<Timebase, DeviceStatus> {
        let status = self.step("minimum_timebase");
        if !status.is_ok() {
            return Err(status);
        }
        if enabled_mask == 0 || enabled_mask > 0b1111 {
            return Err(DeviceStatus::INVALID_CHANNEL);
        }
        let timebase = if enabled_mask.count_ones() > 2 { 2 } else { 1 };
        self.interval_ns = Self::interval_for(timebase);
        Ok(Timebase {
            timebase,
            interval_ns: self.interval_ns,
        })
    }

    fn timebase(&mut self, timebase: u32, _samples: usize) -> Result<Timebase, DeviceStatus> {
        let status = self.step("timebase");
        if !status.is_ok() {
            return Err(status);
        }
        if timebase > 1 << 20 {
            return Err(DeviceStatus::INVALID_TIMEBASE);
        }
        self.interval_ns = Self::interval_for(timebase);
        Ok(Timebase {
            timebase,
            interval_ns: self.interval_ns,
        })
    }

    fn run_block(&mut self, pre: usize, post: usize, _timebase: u32) -> DeviceStatus {
        let status = self.step("run_block");
        if !status.is_ok() {
            return status;
        }
        let len = pre + post;
        self.record_len = len;
        self.polls_left = self.ready_after;
        self.bound.clear();
        let scripted = match self.script.as_mut() {
            Some(script) => Some(script.pop_front().unwrap_or_else(|| RawCapture {
                sample_count: len,
                overflow: 0,
                buffers: Channel::ALL.iter().map(|ch| (*ch, vec![0; len])).collect(),
            })),
            None => None,
        };
        self.pending = Some(match scripted {
            Some(record) => record,
            None => self.generate(pre, len),
        });
        DeviceStatus::OK
    }

    fn is_ready(&mut self) -> Result<bool, DeviceStatus> {
        let status = self.step("is_ready");
        if !status.is_ok() {
            return Err(status);
        }
        self.polls_left = self.polls_left.saturating_sub(1);
        Ok(self.pending.is_some() && self.polls_left == 0)
    }

    fn bind_buffer(&mut self, channel: Channel, len: usize) -> DeviceStatus {
        let status = self.step("bind_buffer");
        if status.is_ok() {
            self.bound.retain(|(ch, _)| *ch != channel);
            self.bound.push((channel, len));
        }
        status
    }

    fn retrieve_values(&mut self) -> Result<RawCapture, DeviceStatus> {
        let status = self.step("retrieve_values");
        if !status.is_ok() {
            return Err(status);
        }
        let record = self.pending.take().ok_or(DeviceStatus::OPERATION_FAILED)?;
        let sample_count = record.sample_count.min(self.record_len);
        let buffers = self
            .bound
            .iter()
            .map(|(ch, len)| {
                let mut buf = record.buffer(*ch).map(<[i16]>::to_vec).unwrap_or_default();
                buf.resize(*len, 0);
                (*ch, buf)
            })
            .collect();
        Ok(RawCapture {
            sample_count: sample_count.min(self.bound.iter().map(|(_, l)| *l).min().unwrap_or(0)),
            overflow: record.overflow,
            buffers,
        })
    }

    fn stop(&mut self) -> DeviceStatus {
        self.released.stops.fetch_add(1, Ordering::SeqCst);
        self.pending = None;
        self.step("stop")
    }

    fn close(&mut self) {
        self.released.closes.fetch_add(1, Ordering::SeqCst);
        self.open = false;
    }
}

/// Builds a scripted record from millivolt samples at the given input range.
pub fn record_from_millivolts(channels: &[(Channel, &[f64])], range_mv: f64) -> RawCapture {
    let sample_count = channels.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
    RawCapture {
        sample_count,
        overflow: 0,
        buffers: channels
            .iter()
            .map(|(ch, values)| {
                let counts = values
                    .iter()
                    .map(|mv| mv_to_adc(*mv, range_mv, DEFAULT_MAX_ADC))
                    .collect();
                (*ch, counts)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bandwidth, Coupling};

    fn setup(range_mv: f64) -> ChannelSetup {
        ChannelSetup {
            coupling: Coupling::Dc50,
            range_mv,
            analog_offset_v: 0.0,
            bandwidth: Bandwidth::Full,
        }
    }

    #[test]
    fn calls_before_open_report_invalid_handle() {
        let mut scope = SimulatedScope::new(1);
        assert_eq!(scope.run_block(10, 10, 1), DeviceStatus::INVALID_HANDLE);
        assert_eq!(scope.open(Resolution::Bits8), DeviceStatus::OK);
        assert_eq!(scope.set_channel(Channel::A, Some(&setup(500.0))), DeviceStatus::OK);
    }

    #[test]
    fn generated_pulse_dips_below_threshold() {
        let mut scope = SimulatedScope::new(7);
        scope.open(Resolution::Bits8);
        scope.set_channel(Channel::A, Some(&setup(500.0)));
        let tb = scope.minimum_timebase(Channel::A.flag(), Resolution::Bits8).unwrap();
        assert_eq!(tb.interval_ns, 0.4);
        assert_eq!(scope.run_block(50, 250, tb.timebase), DeviceStatus::OK);
        assert!(scope.is_ready().unwrap());
        scope.bind_buffer(Channel::A, 300);
        let raw = scope.retrieve_values().unwrap();
        assert_eq!(raw.sample_count, 300);
        let min = raw.buffer(Channel::A).unwrap().iter().copied().min().unwrap();
        let min_mv = scope.to_millivolts(&[min], 500.0, DEFAULT_MAX_ADC)[0];
        assert!(min_mv < -100.0, "pulse minimum {min_mv} mV");
    }

    #[test]
    fn injected_failure_hits_only_the_chosen_call() {
        let mut scope = SimulatedScope::new(0).fail_at("run_block", 2, DeviceStatus(0x07));
        scope.open(Resolution::Bits8);
        scope.set_channel(Channel::A, Some(&setup(200.0)));
        assert!(scope.run_block(5, 5, 1).is_ok());
        assert_eq!(scope.run_block(5, 5, 1), DeviceStatus(0x07));
        assert!(scope.run_block(5, 5, 1).is_ok());
        assert_eq!(scope.calls("run_block"), 3);
    }

    #[test]
    fn scripted_records_replay_then_go_flat() {
        let record = record_from_millivolts(&[(Channel::A, &[0.0, -20.0, 0.0])], 200.0);
        let mut scope = SimulatedScope::scripted(vec![record]).with_ready_after(3);
        scope.open(Resolution::Bits8);
        scope.run_block(1, 2, 0);
        assert!(!scope.is_ready().unwrap());
        assert!(!scope.is_ready().unwrap());
        assert!(scope.is_ready().unwrap());
        scope.bind_buffer(Channel::A, 3);
        let first = scope.retrieve_values().unwrap();
        assert_eq!(first.buffer(Channel::A).unwrap()[1], -3251);

        scope.run_block(1, 2, 0);
        scope.bind_buffer(Channel::A, 3);
        let flat = scope.retrieve_values().unwrap();
        assert_eq!(flat.buffer(Channel::A).unwrap(), &[0, 0, 0]);
    }
}
