use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::acquisition::device::{
    adc_to_mv, mv_to_adc, ChannelSetup, DeviceStatus, ScopeDevice, ThresholdDirection, Timebase,
    TriggerCondition, TriggerDirection, TriggerProperty, TriggerSpec, DEFAULT_MAX_ADC,
};
use crate::acquisition::error::{AcquisitionError, SetupErrors};
use crate::acquisition::gate::{detect_gate, Gate};
use crate::acquisition::measurement::{self, Measurement};
use crate::acquisition::queue::CancelToken;
use crate::acquisition::waveform::Waveform;
use crate::config::Settings;
use crate::recorder::RunLog;
use crate::types::Channel;

const READY_POLL: Duration = Duration::from_micros(200);
/// Extra wait on top of the auto-trigger period before a capture counts as hung.
const READY_GRACE: Duration = Duration::from_secs(2);

/// What a capture measures, and how many trigger channels it needs for that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Mode {
    Charge,
    TimeDifference,
    MeanDelay,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Charge, Mode::TimeDifference, Mode::MeanDelay];

    pub fn target_count(self) -> usize {
        match self {
            Mode::Charge => 1,
            Mode::TimeDifference => 2,
            Mode::MeanDelay => 4,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "adc" | "charge" => Some(Mode::Charge),
            "tdc" | "timedifference" | "time-difference" => Some(Mode::TimeDifference),
            "meantimer" | "mntm" | "meandelay" | "mean-delay" => Some(Mode::MeanDelay),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::Charge => "ADC",
            Mode::TimeDifference => "TDC",
            Mode::MeanDelay => "Meantimer",
        }
    }

    /// Histogram axis title.
    pub fn quantity(self) -> &'static str {
        match self {
            Mode::Charge => "charge (pC)",
            Mode::TimeDifference | Mode::MeanDelay => "deltaT (ns)",
        }
    }

    /// Single falling edge for one target, a falling-level AND of all targets otherwise.
    pub fn trigger(self, thresholds: &[Threshold], delay: u64, auto_trigger_us: u32) -> TriggerSpec {
        match (self, thresholds) {
            (Mode::Charge, [gate, ..]) => TriggerSpec::Simple {
                channel: gate.channel,
                threshold: gate.adc,
                direction: ThresholdDirection::Falling,
                delay,
                auto_trigger_us,
            },
            _ => TriggerSpec::Advanced {
                conditions: thresholds
                    .iter()
                    .map(|t| TriggerCondition {
                        channel: t.channel,
                        active: true,
                    })
                    .collect(),
                directions: thresholds
                    .iter()
                    .map(|t| TriggerDirection {
                        channel: t.channel,
                        direction: ThresholdDirection::Falling,
                    })
                    .collect(),
                properties: thresholds
                    .iter()
                    .map(|t| TriggerProperty {
                        channel: t.channel,
                        threshold_upper: t.adc,
                        hysteresis_upper: 0,
                    })
                    .collect(),
                delay,
                auto_trigger_us,
            },
        }
    }

    /// `gates` follow the trigger targets; `signal` is only used in charge mode.
    pub fn measure(
        self,
        gates: &[Gate],
        signal: Option<&Waveform>,
        resistance_ohms: f64,
    ) -> Option<Measurement> {
        match (self, gates) {
            (Mode::Charge, [gate, ..]) => {
                measurement::charge(signal?, gate, resistance_ohms)
            }
            (Mode::TimeDifference, [a, b, ..]) => measurement::time_difference(a, b),
            (Mode::MeanDelay, [a, b, c, d, ..]) => measurement::mean_delay(&[*a, *b, *c, *d]),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Trigger level for one target channel, both as programmed and as detected.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Threshold {
    pub channel: Channel,
    pub adc: i16,
    pub millivolts: f64,
}

impl Threshold {
    /// Quantizes `threshold_mv` at the channel's offset and range, then maps it back.
    pub fn derive(channel: Channel, threshold_mv: f64, offset_mv: f64, range_mv: f64, max_adc: i16) -> Self {
        let adc = mv_to_adc(threshold_mv + offset_mv, range_mv, max_adc);
        Self {
            channel,
            adc,
            millivolts: adc_to_mv(adc, range_mv, max_adc) - offset_mv,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Configured,
    Idle,
    Busy,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Configured => "configured",
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A measurement and the 1-based number of the capture that produced it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureRecord {
    pub index: u64,
    pub measurement: Measurement,
}

/// Everything one capture produced, for inspection.
#[derive(Clone, Debug)]
pub struct Acquisition {
    pub waveforms: Vec<Waveform>,
    pub gates: Vec<(Channel, Gate)>,
    pub thresholds: Vec<Threshold>,
    pub measurement: Option<Measurement>,
}

impl Acquisition {
    pub fn waveform(&self, channel: Channel) -> Option<&Waveform> {
        self.waveforms.iter().find(|w| w.channel == channel)
    }
}

/// One configured device connection driven through setup, repeated runs and stop.
pub struct CaptureSession<D: ScopeDevice> {
    device: D,
    settings: Settings,
    state: SessionState,
    device_open: bool,
    max_adc: i16,
    thresholds: Vec<Threshold>,
    timebase: Option<Timebase>,
    counter: u64,
    log: Option<RunLog>,
    cancel: Option<CancelToken>,
}

impl<D: ScopeDevice> CaptureSession<D> {
    pub fn new(device: D, settings: Settings) -> Self {
        Self {
            device,
            settings,
            state: SessionState::Created,
            device_open: false,
            max_adc: DEFAULT_MAX_ADC,
            thresholds: Vec::new(),
            timebase: None,
            counter: 1,
            log: None,
            cancel: None,
        }
    }

    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Lets a pending ready-poll give up when the run is cancelled.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    pub fn timebase(&self) -> Option<Timebase> {
        self.timebase
    }

    /// Number the next successful capture will get.
    pub fn next_index(&self) -> u64 {
        self.counter
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn log_entry(&mut self, text: &str, stamped: bool) {
        if let Some(log) = self.log.as_mut() {
            log.entry(text, stamped);
        }
    }

    /// Opens and programs the device. Reports every failing step, not just the first.
    pub fn setup(&mut self) -> Result<(), SetupErrors> {
        if self.state != SessionState::Created {
            return Err(SetupErrors(vec![AcquisitionError::InvalidState {
                state: self.state.name(),
                operation: "set up",
            }]));
        }

        let problems = self.settings.validate();
        if !problems.is_empty() {
            self.state = SessionState::Failed;
            let errors = SetupErrors(
                problems
                    .into_iter()
                    .map(AcquisitionError::Configuration)
                    .collect(),
            );
            self.log_entry(&format!("==> Job finished with error: {errors}"), true);
            return Err(errors);
        }

        if let Some(log) = self.log.as_mut() {
            log.parameters(&self.settings);
        }

        let mut errors = SetupErrors::default();
        let resolution = self.settings.resolution;
        let status = self.device.open(resolution);
        self.device_open = true;
        push_status(&mut errors, "open", status);

        for ch in Channel::ALL {
            let cfg = self.settings.channel(ch);
            let setup = cfg.enabled.then(|| ChannelSetup {
                coupling: cfg.coupling,
                range_mv: cfg.range_mv(),
                analog_offset_v: cfg.analog_offset_v,
                bandwidth: cfg.bandwidth,
            });
            let status = self.device.set_channel(ch, setup.as_ref());
            push_status(&mut errors, channel_step(ch, setup.is_some()), status);
        }

        match self.device.max_adc(resolution) {
            Ok(max) if max > 0 => self.max_adc = max,
            Ok(max) => errors.push(AcquisitionError::Configuration(format!(
                "device reported a non-positive full scale ({max})"
            ))),
            Err(status) => errors.push(AcquisitionError::device("max_adc", status)),
        }

        self.thresholds = self
            .settings
            .targets
            .iter()
            .map(|&ch| {
                let cfg = self.settings.channel(ch);
                Threshold::derive(
                    ch,
                    self.settings.threshold_mv,
                    cfg.offset_mv(),
                    cfg.range_mv(),
                    self.max_adc,
                )
            })
            .collect();

        let trigger = self.settings.mode.trigger(
            &self.thresholds,
            self.settings.trigger_delay,
            self.settings.auto_trigger_ms.saturating_mul(1000),
        );
        let status = self.device.set_trigger(&trigger);
        push_status(&mut errors, "set_trigger", status);

        let timebase = match self.settings.timebase {
            Some(fixed) => self
                .device
                .timebase(fixed, self.settings.max_samples)
                .map_err(|s| AcquisitionError::device("timebase", s)),
            None => self
                .device
                .minimum_timebase(self.settings.enabled_mask(), resolution)
                .map_err(|s| AcquisitionError::device("minimum_timebase", s)),
        };
        match timebase {
            Ok(tb) => self.timebase = Some(tb),
            Err(err) => errors.push(err),
        }

        if errors.is_empty() {
            self.state = SessionState::Configured;
            if let Some(tb) = self.timebase {
                info!(
                    "{} session ready: timebase {} ({:.3} ns/sample), thresholds {:?}",
                    self.settings.mode,
                    tb.timebase,
                    tb.interval_ns,
                    self.thresholds
                        .iter()
                        .map(|t| format!("{}: {:.3} mV", t.channel, t.millivolts))
                        .collect::<Vec<_>>()
                );
            }
            Ok(())
        } else {
            self.device.close();
            self.device_open = false;
            self.state = SessionState::Failed;
            self.log_entry(&format!("==> Job finished with error: {errors}"), true);
            Err(errors)
        }
    }

    /// Captures once. A capture without a usable crossing is `CaptureTimeout`.
    pub fn run(&mut self) -> Result<CaptureRecord, AcquisitionError> {
        self.log_entry(&format!("==> Beginning capture no. {}", self.counter), true);
        let acquisition = self.acquire()?;
        match acquisition.measurement {
            Some(measurement) => {
                let record = CaptureRecord {
                    index: self.counter,
                    measurement,
                };
                self.counter += 1;
                self.log_entry("Ok!", false);
                Ok(record)
            }
            None => {
                self.log_entry("Skipping (trigger timeout).", false);
                Err(AcquisitionError::CaptureTimeout)
            }
        }
    }

    /// Captures once for inspection without numbering or logging the capture.
    pub fn probe(&mut self) -> Result<Acquisition, AcquisitionError> {
        self.acquire()
    }

    /// Releases the device. Safe to call repeatedly; only the first call touches the device.
    pub fn stop(&mut self) -> Result<(), AcquisitionError> {
        if !self.device_open {
            if self.state != SessionState::Failed {
                self.state = SessionState::Stopped;
            }
            return Ok(());
        }
        let status = self.release();
        if self.state != SessionState::Failed {
            self.state = SessionState::Stopped;
        }
        status.check("stop")
    }

    fn release(&mut self) -> DeviceStatus {
        let status = self.device.stop();
        if !status.is_ok() {
            warn!("device stop returned {status}; closing anyway");
        }
        self.device.close();
        self.device_open = false;
        status
    }

    fn acquire(&mut self) -> Result<Acquisition, AcquisitionError> {
        match self.state {
            SessionState::Configured | SessionState::Idle => {}
            state => {
                return Err(AcquisitionError::InvalidState {
                    state: state.name(),
                    operation: "capture",
                })
            }
        }
        self.state = SessionState::Busy;
        match self.capture() {
            Ok(acquisition) => {
                self.state = SessionState::Idle;
                Ok(acquisition)
            }
            Err(AcquisitionError::CaptureTimeout) => {
                self.state = SessionState::Idle;
                Err(AcquisitionError::CaptureTimeout)
            }
            Err(err) => {
                self.release();
                self.state = SessionState::Failed;
                self.log_entry(&format!("==> Job finished with error: {err}"), true);
                Err(err)
            }
        }
    }

    fn capture(&mut self) -> Result<Acquisition, AcquisitionError> {
        let timebase = self.timebase.ok_or(AcquisitionError::InvalidState {
            state: self.state.name(),
            operation: "capture without a timebase",
        })?;
        let pre = self.settings.pre_trigger_samples;
        let post = self.settings.post_trigger_samples;
        self.device
            .run_block(pre, post, timebase.timebase)
            .check("run_block")?;
        self.wait_ready()?;

        let channels = self.captured_channels();
        for &ch in &channels {
            self.device
                .bind_buffer(ch, self.settings.max_samples)
                .check("bind_buffer")?;
        }
        let raw = self
            .device
            .retrieve_values()
            .map_err(|s| AcquisitionError::device("retrieve_values", s))?;
        if raw.overflow != 0 {
            debug!("over-range on channel mask {:#06b}", raw.overflow);
        }

        let waveforms: Vec<Waveform> = channels
            .iter()
            .map(|&ch| {
                let cfg = self.settings.channel(ch);
                let offset_mv = cfg.offset_mv();
                let values = self
                    .device
                    .to_millivolts(raw.buffer(ch).unwrap_or(&[]), cfg.range_mv(), self.max_adc)
                    .into_iter()
                    .map(|mv| mv - offset_mv)
                    .collect();
                Waveform::new(ch, values, timebase.interval_ns)
            })
            .collect();

        let gates: Vec<(Channel, Gate)> = self
            .thresholds
            .iter()
            .map(|t| {
                let gate = match waveforms.iter().find(|w| w.channel == t.channel) {
                    Some(w) => detect_gate(&w.values, &w.times(), t.millivolts),
                    None => detect_gate(&[], &[], t.millivolts),
                };
                (t.channel, gate)
            })
            .collect();

        let signal_channel = self.settings.signal_channel();
        let signal = signal_channel.and_then(|ch| waveforms.iter().find(|w| w.channel == ch));
        let resistance = signal_channel
            .map(|ch| self.settings.channel(ch).coupling.resistance_ohms())
            .unwrap_or(1.0);
        let only_gates: Vec<Gate> = gates.iter().map(|(_, g)| *g).collect();
        let measurement = self.settings.mode.measure(&only_gates, signal, resistance);

        Ok(Acquisition {
            waveforms,
            gates,
            thresholds: self.thresholds.clone(),
            measurement,
        })
    }

    // gate then signal in charge mode, the trigger targets otherwise
    fn captured_channels(&self) -> Vec<Channel> {
        let mut channels = self.settings.targets.clone();
        if self.settings.mode == Mode::Charge {
            channels.truncate(1);
            if let Some(signal) = self.settings.signal_channel() {
                channels.push(signal);
            }
        }
        channels
    }

    fn wait_ready(&mut self) -> Result<(), AcquisitionError> {
        let auto = self.settings.auto_trigger_ms;
        let deadline = (auto > 0)
            .then(|| Instant::now() + Duration::from_millis(u64::from(auto)) * 2 + READY_GRACE);
        loop {
            if self
                .device
                .is_ready()
                .map_err(|s| AcquisitionError::device("is_ready", s))?
            {
                return Ok(());
            }
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                debug!("capture abandoned on cancellation");
                let status = self.device.stop();
                if !status.is_ok() {
                    warn!("device stop on cancellation returned {status}");
                }
                return Err(AcquisitionError::CaptureTimeout);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(AcquisitionError::device(
                    "is_ready",
                    DeviceStatus::NOT_RESPONDING,
                ));
            }
            thread::sleep(READY_POLL);
        }
    }
}

impl<D: ScopeDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if self.device_open {
            self.release();
        }
    }
}

fn push_status(errors: &mut SetupErrors, step: &'static str, status: DeviceStatus) {
    if let Err(err) = status.check(step) {
        errors.push(err);
    }
}

fn channel_step(channel: Channel, enabled: bool) -> &'static str {
    match (channel, enabled) {
        (Channel::A, true) => "set_channel_on(A)",
        (Channel::B, true) => "set_channel_on(B)",
        (Channel::C, true) => "set_channel_on(C)",
        (Channel::D, true) => "set_channel_on(D)",
        (Channel::A, false) => "set_channel_off(A)",
        (Channel::B, false) => "set_channel_off(B)",
        (Channel::C, false) => "set_channel_off(C)",
        (Channel::D, false) => "set_channel_off(D)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::device::RawCapture;
    use crate::acquisition::simulated::{record_from_millivolts, SimulatedScope};
    use crate::types::Coupling;

    const PULSE: [f64; 9] = [0.0, -10.0, -20.0, -30.0, -40.0, -30.0, -20.0, -10.0, 0.0];

    fn charge_settings() -> Settings {
        let mut s = Settings::default();
        for ch in [Channel::A, Channel::B] {
            s.channels[ch.index()].enabled = true;
            s.channels[ch.index()].range = 4; // 200 mV
            s.channels[ch.index()].coupling = Coupling::Dc50;
        }
        s.channels[Channel::C.index()].enabled = false;
        s.targets = vec![Channel::A];
        s.signal = Some(Channel::B);
        s.threshold_mv = -20.0;
        s.pre_trigger_samples = 4;
        s.post_trigger_samples = 5;
        s.max_samples = 9;
        s
    }

    fn pulse_record() -> RawCapture {
        record_from_millivolts(&[(Channel::A, &PULSE), (Channel::B, &PULSE)], 200.0)
    }

    fn flat_record() -> RawCapture {
        let flat = [0.0; 9];
        record_from_millivolts(&[(Channel::A, &flat), (Channel::B, &flat)], 200.0)
    }

    #[test]
    fn setup_programs_simple_falling_trigger() {
        let mut session = CaptureSession::new(SimulatedScope::scripted(vec![]), charge_settings());
        session.setup().unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        let threshold = session.thresholds()[0];
        assert_eq!(threshold.adc, -3251);
        assert!((threshold.millivolts + 20.0).abs() < 0.01);
        match session.device().trigger() {
            Some(TriggerSpec::Simple {
                channel,
                direction,
                auto_trigger_us,
                ..
            }) => {
                assert_eq!(*channel, Channel::A);
                assert_eq!(*direction, ThresholdDirection::Falling);
                assert_eq!(*auto_trigger_us, 1_000_000);
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn run_measures_charge_and_numbers_captures() {
        let scope = SimulatedScope::scripted(vec![pulse_record(), pulse_record()]);
        let mut session = CaptureSession::new(scope, charge_settings());
        session.setup().unwrap();
        let first = session.run().unwrap();
        let second = session.run().unwrap();
        assert_eq!((first.index, second.index), (1, 2));
        let Measurement::Charge {
            value, amplitude, ..
        } = first.measurement
        else {
            panic!("expected charge");
        };
        // 200 mV range quantizes the samples slightly, interval is 0.4 ns
        assert!((value - 2.4 * 0.4).abs() < 1e-3, "charge {value}");
        assert!((amplitude - 40.0).abs() < 0.01);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn flat_capture_is_a_timeout_and_keeps_the_counter() {
        let scope = SimulatedScope::scripted(vec![flat_record(), pulse_record()]);
        let mut session = CaptureSession::new(scope, charge_settings());
        session.setup().unwrap();
        let err = session.run().unwrap_err();
        assert!(matches!(err, AcquisitionError::CaptureTimeout));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.run().unwrap().index, 1);
    }

    #[test]
    fn probe_does_not_advance_counter() {
        let scope = SimulatedScope::scripted(vec![pulse_record()]);
        let mut session = CaptureSession::new(scope, charge_settings());
        session.setup().unwrap();
        let probe = session.probe().unwrap();
        assert_eq!(probe.waveforms.len(), 2);
        assert_eq!(probe.gates[0].1.open.index(), Some(2));
        assert!(probe.measurement.is_some());
        assert_eq!(session.next_index(), 1);
    }

    #[test]
    fn setup_collects_every_failing_step() {
        let scope = SimulatedScope::scripted(vec![])
            .fail_at("set_channel", 2, DeviceStatus::INVALID_CHANNEL)
            .fail_at("set_trigger", 1, DeviceStatus::INVALID_PARAMETER)
            .fail_at("minimum_timebase", 1, DeviceStatus::INVALID_TIMEBASE);
        let mut session = CaptureSession::new(scope, charge_settings());
        let errors = session.setup().unwrap_err();
        assert_eq!(errors.len(), 3);
        let text = errors.to_string();
        assert!(text.contains("set_channel_on(B)"));
        assert!(text.contains("set_trigger"));
        assert!(text.contains("minimum_timebase"));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.device().close_calls(), 1);
        assert!(matches!(
            session.run(),
            Err(AcquisitionError::InvalidState { .. })
        ));
    }

    #[test]
    fn invalid_configuration_never_touches_the_device() {
        let mut settings = charge_settings();
        settings.mode = Mode::TimeDifference;
        let mut session = CaptureSession::new(SimulatedScope::scripted(vec![]), settings);
        let errors = session.setup().unwrap_err();
        assert!(errors
            .iter()
            .all(|e| matches!(e, AcquisitionError::Configuration(_))));
        assert_eq!(session.device().calls("open"), 0);
    }

    #[test]
    fn device_error_during_run_stops_and_fails() {
        let scope = SimulatedScope::scripted(vec![pulse_record()]).fail_at(
            "retrieve_values",
            1,
            DeviceStatus::NOT_RESPONDING,
        );
        let mut session = CaptureSession::new(scope, charge_settings());
        session.setup().unwrap();
        let err = session.run().unwrap_err();
        assert!(matches!(err, AcquisitionError::Device { step: "retrieve_values", .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.device().stop_calls(), 1);
        assert_eq!(session.device().close_calls(), 1);
        // already released
        session.stop().unwrap();
        assert_eq!(session.device().close_calls(), 1);
    }

    #[test]
    fn stop_twice_releases_once() {
        let mut session = CaptureSession::new(SimulatedScope::scripted(vec![]), charge_settings());
        session.setup().unwrap();
        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.device().stop_calls(), 1);
        assert_eq!(session.device().close_calls(), 1);
    }

    #[test]
    fn failing_stop_is_reported_after_release() {
        let scope = SimulatedScope::scripted(vec![]).fail_at("stop", 1, DeviceStatus::OPERATION_FAILED);
        let mut session = CaptureSession::new(scope, charge_settings());
        session.setup().unwrap();
        assert!(session.stop().is_err());
        assert_eq!(session.device().close_calls(), 1);
        assert!(!session.device().is_open());
    }

    #[test]
    fn time_difference_uses_advanced_trigger() {
        let mut settings = charge_settings();
        settings.mode = Mode::TimeDifference;
        settings.targets = vec![Channel::A, Channel::B];
        let late: Vec<f64> = std::iter::once(0.0)
            .chain(PULSE.iter().copied().take(8))
            .collect();
        let record = record_from_millivolts(&[(Channel::A, &PULSE), (Channel::B, &late)], 200.0);
        let mut session = CaptureSession::new(SimulatedScope::scripted(vec![record]), settings);
        session.setup().unwrap();
        assert!(matches!(
            session.device().trigger(),
            Some(TriggerSpec::Advanced { properties, .. }) if properties.len() == 2
        ));
        let record = session.run().unwrap();
        // one sample later at 0.4 ns per sample
        assert!((record.measurement.value() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn mean_delay_pairs_a_b_against_c_d() {
        let mut settings = charge_settings();
        settings.mode = Mode::MeanDelay;
        settings.targets = Channel::ALL.to_vec();
        for ch in Channel::ALL {
            settings.channels[ch.index()].enabled = true;
            settings.channels[ch.index()].range = 4;
        }
        settings.signal = None;
        settings.pre_trigger_samples = 4;
        settings.post_trigger_samples = 10;
        settings.max_samples = 14;

        // pulse shifted by 0, 1, 4 and 5 samples on A..D
        let shifted = |k: usize| -> Vec<f64> {
            let mut v = vec![0.0; k];
            v.extend_from_slice(&PULSE);
            v.resize(14, 0.0);
            v
        };
        let traces: Vec<Vec<f64>> = [0, 1, 4, 5].iter().map(|&k| shifted(k)).collect();
        let record = record_from_millivolts(
            &[
                (Channel::A, &traces[0]),
                (Channel::B, &traces[1]),
                (Channel::C, &traces[2]),
                (Channel::D, &traces[3]),
            ],
            200.0,
        );
        let mut session = CaptureSession::new(SimulatedScope::scripted(vec![record]), settings);
        session.setup().unwrap();
        match session.device().trigger() {
            Some(TriggerSpec::Advanced {
                conditions,
                directions,
                properties,
                ..
            }) => {
                let order: Vec<Channel> = properties.iter().map(|p| p.channel).collect();
                assert_eq!(order, Channel::ALL.to_vec());
                assert_eq!(conditions.len(), 4);
                assert!(directions
                    .iter()
                    .all(|d| d.direction == ThresholdDirection::Falling));
            }
            other => panic!("unexpected trigger {other:?}"),
        }

        let interval = session.timebase().unwrap().interval_ns;
        let record = session.run().unwrap();
        assert!(matches!(record.measurement, Measurement::MeanDelay { .. }));
        // midpoint(C, D) - midpoint(A, B) = (4.5 - 0.5) samples
        assert!((record.measurement.value() - 4.0 * interval).abs() < 1e-9);
    }

    #[test]
    fn cancelled_wait_stops_the_block_even_if_stop_fails() {
        let scope = SimulatedScope::scripted(vec![pulse_record()])
            .with_ready_after(1_000)
            .fail_at("stop", 1, DeviceStatus::OPERATION_FAILED);
        let cancel = CancelToken::new();
        let mut session = CaptureSession::new(scope, charge_settings()).with_cancel(cancel.clone());
        session.setup().unwrap();
        cancel.cancel();

        assert!(matches!(session.run(), Err(AcquisitionError::CaptureTimeout)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.device().stop_calls(), 1);
        assert_eq!(session.next_index(), 1);
        session.stop().unwrap();
        assert_eq!(session.device().close_calls(), 1);
    }

    #[test]
    fn pinned_timebase_skips_the_minimum_query() {
        let mut settings = charge_settings();
        settings.timebase = Some(3);
        let mut session = CaptureSession::new(SimulatedScope::scripted(vec![]), settings);
        session.setup().unwrap();
        assert_eq!(session.timebase().unwrap().timebase, 3);
        assert_eq!(session.device().calls("timebase"), 1);
        assert_eq!(session.device().calls("minimum_timebase"), 0);
    }

    #[test]
    fn mode_names_cover_legacy_spellings() {
        assert_eq!(Mode::from_name("ADC"), Some(Mode::Charge));
        assert_eq!(Mode::from_name("tdc"), Some(Mode::TimeDifference));
        assert_eq!(Mode::from_name("MNTM"), Some(Mode::MeanDelay));
        assert_eq!(Mode::from_name("fft"), None);
        assert_eq!(Mode::MeanDelay.target_count(), 4);
    }
}
