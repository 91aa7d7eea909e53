use std::fmt;

use serde::Serialize;

use crate::acquisition::error::AcquisitionError;
use crate::types::{Bandwidth, Channel, Coupling};

/// Selectable input ranges in mV, indexed by the `chXrange` setting.
pub const INPUT_RANGES_MV: [f64; 14] = [
    10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1_000.0, 2_000.0, 5_000.0, 10_000.0, 20_000.0,
    50_000.0, 100_000.0, 200_000.0,
];

/// Full-scale count of the 8-bit mode.
pub const DEFAULT_MAX_ADC: i16 = 32_512;

/// Raw status code returned by every device call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceStatus(pub u32);

impl DeviceStatus {
    pub const OK: DeviceStatus = DeviceStatus(0x00);
    pub const NOT_FOUND: DeviceStatus = DeviceStatus(0x03);
    pub const OPERATION_FAILED: DeviceStatus = DeviceStatus(0x06);
    pub const NOT_RESPONDING: DeviceStatus = DeviceStatus(0x07);
    pub const INVALID_HANDLE: DeviceStatus = DeviceStatus(0x0C);
    pub const INVALID_PARAMETER: DeviceStatus = DeviceStatus(0x0D);
    pub const INVALID_TIMEBASE: DeviceStatus = DeviceStatus(0x0E);
    pub const INVALID_VOLTAGE_RANGE: DeviceStatus = DeviceStatus(0x0F);
    pub const INVALID_CHANNEL: DeviceStatus = DeviceStatus(0x10);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn check(self, step: &'static str) -> Result<(), AcquisitionError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(AcquisitionError::device(step, self))
        }
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0x00 => "PICO_OK",
            0x01 => "PICO_MAX_UNITS_OPENED",
            0x02 => "PICO_MEMORY_FAIL",
            0x03 => "PICO_NOT_FOUND",
            0x04 => "PICO_FW_FAIL",
            0x05 => "PICO_OPEN_OPERATION_IN_PROGRESS",
            0x06 => "PICO_OPERATION_FAILED",
            0x07 => "PICO_NOT_RESPONDING",
            0x08 => "PICO_CONFIG_FAIL",
            0x09 => "PICO_KERNEL_DRIVER_TOO_OLD",
            0x0A => "PICO_EEPROM_CORRUPT",
            0x0B => "PICO_OS_NOT_SUPPORTED",
            0x0C => "PICO_INVALID_HANDLE",
            0x0D => "PICO_INVALID_PARAMETER",
            0x0E => "PICO_INVALID_TIMEBASE",
            0x0F => "PICO_INVALID_VOLTAGE_RANGE",
            0x10 => "PICO_INVALID_CHANNEL",
            0x11 => "PICO_INVALID_TRIGGER_CHANNEL",
            0x12 => "PICO_INVALID_CONDITION_CHANNEL",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "0x{:02X} ({name})", self.0),
            None => write!(f, "0x{:02X}", self.0),
        }
    }
}

/// Vertical resolution; the codes are the vendor enumeration values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum Resolution {
    #[default]
    Bits8,
    Bits10,
    Bits12,
}

impl Resolution {
    pub fn code(self) -> u32 {
        match self {
            Resolution::Bits8 => 0,
            Resolution::Bits10 => 10,
            Resolution::Bits12 => 1,
        }
    }

    pub fn from_bits(bits: i64) -> Option<Self> {
        match bits {
            8 => Some(Resolution::Bits8),
            10 => Some(Resolution::Bits10),
            12 => Some(Resolution::Bits12),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSetup {
    pub coupling: Coupling,
    pub range_mv: f64,
    pub analog_offset_v: f64,
    pub bandwidth: Bandwidth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdDirection {
    Rising,
    Falling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerCondition {
    pub channel: Channel,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerDirection {
    pub channel: Channel,
    pub direction: ThresholdDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerProperty {
    pub channel: Channel,
    pub threshold_upper: i16,
    pub hysteresis_upper: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TriggerSpec {
    Simple {
        channel: Channel,
        threshold: i16,
        direction: ThresholdDirection,
        delay: u64,
        auto_trigger_us: u32,
    },
    Advanced {
        conditions: Vec<TriggerCondition>,
        directions: Vec<TriggerDirection>,
        properties: Vec<TriggerProperty>,
        delay: u64,
        auto_trigger_us: u32,
    },
}

impl TriggerSpec {
    /// Channels whose threshold crossing arms the trigger.
    pub fn sources(&self) -> Vec<(Channel, i16)> {
        match self {
            TriggerSpec::Simple {
                channel, threshold, ..
            } => vec![(*channel, *threshold)],
            TriggerSpec::Advanced { properties, .. } => properties
                .iter()
                .map(|p| (p.channel, p.threshold_upper))
                .collect(),
        }
    }

    pub fn auto_trigger_us(&self) -> u32 {
        match self {
            TriggerSpec::Simple {
                auto_trigger_us, ..
            }
            | TriggerSpec::Advanced {
                auto_trigger_us, ..
            } => *auto_trigger_us,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timebase {
    pub timebase: u32,
    pub interval_ns: f64,
}

/// Samples fetched after one block capture, one buffer per bound channel.
#[derive(Clone, Debug, Default)]
pub struct RawCapture {
    pub sample_count: usize,
    pub overflow: u16,
    pub buffers: Vec<(Channel, Vec<i16>)>,
}

impl RawCapture {
    pub fn buffer(&self, channel: Channel) -> Option<&[i16]> {
        self.buffers
            .iter()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, buf)| &buf[..self.sample_count.min(buf.len())])
    }
}

/// Block-mode digitizer driven by a capture session.
pub trait ScopeDevice: Send {
    fn open(&mut self, resolution: Resolution) -> DeviceStatus;
    /// `None` disables the channel.
    fn set_channel(&mut self, channel: Channel, setup: Option<&ChannelSetup>) -> DeviceStatus;
    fn max_adc(&mut self, resolution: Resolution) -> Result<i16, DeviceStatus>;
    fn set_trigger(&mut self, trigger: &TriggerSpec) -> DeviceStatus;
    fn minimum_timebase(
        &mut self,
        enabled_mask: u32,
        resolution: Resolution,
    ) -> Result<Timebase, DeviceStatus>;
    fn timebase(&mut self, timebase: u32, samples: usize) -> Result<Timebase, DeviceStatus>;
    fn run_block(&mut self, pre: usize, post: usize, timebase: u32) -> DeviceStatus;
    fn is_ready(&mut self) -> Result<bool, DeviceStatus>;
    fn bind_buffer(&mut self, channel: Channel, len: usize) -> DeviceStatus;
    fn retrieve_values(&mut self) -> Result<RawCapture, DeviceStatus>;
    fn to_millivolts(&self, raw: &[i16], range_mv: f64, max_adc: i16) -> Vec<f64> {
        raw.iter()
            .map(|&count| adc_to_mv(count, range_mv, max_adc))
            .collect()
    }
    fn stop(&mut self) -> DeviceStatus;
    fn close(&mut self);
}

impl<T: ScopeDevice + ?Sized> ScopeDevice for Box<T> {
    fn open(&mut self, resolution: Resolution) -> DeviceStatus {
        (**self).open(resolution)
    }
    fn set_channel(&mut self, channel: Channel, setup: Option<&ChannelSetup>) -> DeviceStatus {
        (**self).set_channel(channel, setup)
    }
    fn max_adc(&mut self, resolution: Resolution) -> Result<i16, DeviceStatus> {
        (**self).max_adc(resolution)
    }
    fn set_trigger(&mut self, trigger: &TriggerSpec) -> DeviceStatus {
        (**self).set_trigger(trigger)
    }
    fn minimum_timebase(
        &mut self,
        enabled_mask: u32,
        resolution: Resolution,
    ) -> Result<Timebase, DeviceStatus> {
        (**self).minimum_timebase(enabled_mask, resolution)
    }
    fn timebase(&mut self, timebase: u32, samples: usize) -> Result<Timebase, DeviceStatus> {
        (**self).timebase(timebase, samples)
    }
    fn run_block(&mut self, pre: usize, post: usize, timebase: u32) -> DeviceStatus {
        (**self).run_block(pre, post, timebase)
    }
    fn is_ready(&mut self) -> Result<bool, DeviceStatus> {
        (**self).is_ready()
    }
    fn bind_buffer(&mut self, channel: Channel, len: usize) -> DeviceStatus {
        (**self).bind_buffer(channel, len)
    }
    fn retrieve_values(&mut self) -> Result<RawCapture, DeviceStatus> {
        (**self).retrieve_values()
    }
    fn to_millivolts(&self, raw: &[i16], range_mv: f64, max_adc: i16) -> Vec<f64> {
        (**self).to_millivolts(raw, range_mv, max_adc)
    }
    fn stop(&mut self) -> DeviceStatus {
        (**self).stop()
    }
    fn close(&mut self) {
        (**self).close()
    }
}

pub fn adc_to_mv(count: i16, range_mv: f64, max_adc: i16) -> f64 {
    count as f64 * range_mv / max_adc as f64
}

/// Truncates toward zero and saturates at the i16 limits.
pub fn mv_to_adc(millivolts: f64, range_mv: f64, max_adc: i16) -> i16 {
    let counts = (millivolts / range_mv * max_adc as f64).trunc();
    counts.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_names_known_codes() {
        assert_eq!(DeviceStatus::OK.to_string(), "0x00 (PICO_OK)");
        assert_eq!(DeviceStatus(0x0C).to_string(), "0x0C (PICO_INVALID_HANDLE)");
        assert_eq!(DeviceStatus(0x1FF).to_string(), "0x1FF");
        assert!(DeviceStatus::OK.check("open").is_ok());
        assert!(DeviceStatus::NOT_FOUND.check("open").is_err());
    }

    #[test]
    fn adc_conversion_truncates_and_saturates() {
        assert_eq!(mv_to_adc(-100.0, 200.0, DEFAULT_MAX_ADC), -16_256);
        assert_eq!(mv_to_adc(-33.3, 200.0, 32_512), -5_413);
        assert_eq!(mv_to_adc(-5_000.0, 10.0, DEFAULT_MAX_ADC), i16::MIN);
        assert_eq!(adc_to_mv(-16_256, 200.0, DEFAULT_MAX_ADC), -100.0);
    }

    #[test]
    fn raw_capture_clips_to_sample_count() {
        let raw = RawCapture {
            sample_count: 2,
            overflow: 0,
            buffers: vec![(Channel::B, vec![1, 2, 3])],
        };
        assert_eq!(raw.buffer(Channel::B), Some(&[1, 2][..]));
        assert_eq!(raw.buffer(Channel::A), None);
    }
}
