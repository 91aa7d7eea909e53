use std::os::raw::{c_double, c_void};
use std::ptr;

use anyhow::{Context, Result};
use libloading::Library;
use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::acquisition::device::{
    ChannelSetup, DeviceStatus, RawCapture, Resolution, ScopeDevice, ThresholdDirection, Timebase,
    TriggerSpec,
};
use crate::types::{Bandwidth, Channel, Coupling};

type Status = u32;

const CONDITION_TRUE: i32 = 1;
const DIRECTION_RISING: i32 = 2;
const DIRECTION_FALLING: i32 = 3;
const THRESHOLD_MODE_LEVEL: i32 = 0;
const ACTION_CLEAR_ALL: i32 = 0x0000_0001;
const ACTION_ADD: i32 = 0x0000_0002;
const RATIO_MODE_RAW: i32 = 0x8000_0000_u32 as i32;
const DATA_TYPE_INT16: i32 = 1;
const PROBE_NONE_NV: i32 = 0;
const BANDWIDTH_20MHZ: i32 = 20_000_000;

#[repr(C)]
#[derive(Clone, Copy)]
struct PicoCondition {
    source: i32,
    condition: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PicoDirection {
    channel: i32,
    direction: i32,
    threshold_mode: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PicoTriggerChannelProperties {
    threshold_upper: i16,
    threshold_upper_hysteresis: u16,
    threshold_lower: i16,
    threshold_lower_hysteresis: u16,
    channel: i32,
}

struct PsospaApi {
    #[allow(dead_code)]
    lib: Library,
    open_unit: unsafe extern "C" fn(*mut i16, *mut i8, u32, *mut c_void) -> Status,
    close_unit: unsafe extern "C" fn(i16) -> Status,
    set_channel_on: unsafe extern "C" fn(i16, i32, i32, i64, i64, i32, c_double, i32) -> Status,
    set_channel_off: unsafe extern "C" fn(i16, i32) -> Status,
    get_adc_limits: unsafe extern "C" fn(i16, u32, *mut i16, *mut i16) -> Status,
    set_simple_trigger: unsafe extern "C" fn(i16, i16, i32, i16, i32, u64, u32) -> Status,
    set_trigger_channel_conditions: unsafe extern "C" fn(i16, *const PicoCondition, i16, i32) -> Status,
    set_trigger_channel_directions: unsafe extern "C" fn(i16, *const PicoDirection, i16) -> Status,
    set_trigger_channel_properties:
        unsafe extern "C" fn(i16, *const PicoTriggerChannelProperties, i16, u32) -> Status,
    set_trigger_delay: unsafe extern "C" fn(i16, u64) -> Status,
    get_minimum_timebase_stateless: unsafe extern "C" fn(i16, u32, *mut u32, *mut c_double, u32) -> Status,
    get_timebase: unsafe extern "C" fn(i16, u32, u64, *mut c_double, *mut u64, u64) -> Status,
    run_block: unsafe extern "C" fn(
        i16,
        u64,
        u64,
        u32,
        *mut c_double,
        u64,
        *const c_void,
        *mut c_void,
    ) -> Status,
    is_ready: unsafe extern "C" fn(i16, *mut i16) -> Status,
    set_data_buffer: unsafe extern "C" fn(i16, i32, *mut c_void, i32, i32, u64, i32, i32) -> Status,
    get_values: unsafe extern "C" fn(i16, u64, *mut u64, u64, i32, u64, *mut i16) -> Status,
    stop: unsafe extern "C" fn(i16) -> Status,
}

impl PsospaApi {
    fn load() -> Result<Self> {
        let name = libloading::library_filename("psospa");
        let lib = unsafe { Library::new(&name) }
            .with_context(|| format!("{} not found; install the PicoSDK", name.to_string_lossy()))?;
        // Safety: signatures follow psospaApi.h from the PicoSDK.
        unsafe {
            Ok(Self {
                open_unit: *lib.get(b"psospaOpenUnit\0")?,
                close_unit: *lib.get(b"psospaCloseUnit\0")?,
                set_channel_on: *lib.get(b"psospaSetChannelOn\0")?,
                set_channel_off: *lib.get(b"psospaSetChannelOff\0")?,
                get_adc_limits: *lib.get(b"psospaGetAdcLimits\0")?,
                set_simple_trigger: *lib.get(b"psospaSetSimpleTrigger\0")?,
                set_trigger_channel_conditions: *lib.get(b"psospaSetTriggerChannelConditions\0")?,
                set_trigger_channel_directions: *lib.get(b"psospaSetTriggerChannelDirections\0")?,
                set_trigger_channel_properties: *lib.get(b"psospaSetTriggerChannelProperties\0")?,
                set_trigger_delay: *lib.get(b"psospaSetTriggerDelay\0")?,
                get_minimum_timebase_stateless: *lib.get(b"psospaGetMinimumTimebaseStateless\0")?,
                get_timebase: *lib.get(b"psospaGetTimebase\0")?,
                run_block: *lib.get(b"psospaRunBlock\0")?,
                is_ready: *lib.get(b"psospaIsReady\0")?,
                set_data_buffer: *lib.get(b"psospaSetDataBuffer\0")?,
                get_values: *lib.get(b"psospaGetValues\0")?,
                stop: *lib.get(b"psospaStop\0")?,
                lib,
            })
        }
    }

    fn instance() -> Result<&'static PsospaApi> {
        static API: OnceCell<PsospaApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }
}

fn channel_id(channel: Channel) -> i32 {
    channel.index() as i32
}

fn coupling_code(coupling: Coupling) -> i32 {
    match coupling {
        Coupling::Ac1M => 0,
        Coupling::Dc1M => 1,
        Coupling::Dc50 => 50,
    }
}

fn direction_code(direction: ThresholdDirection) -> i32 {
    match direction {
        ThresholdDirection::Rising => DIRECTION_RISING,
        ThresholdDirection::Falling => DIRECTION_FALLING,
    }
}

/// PicoScope 3000E-series unit behind the `psospa` driver.
pub struct PicoScope {
    api: &'static PsospaApi,
    handle: i16,
    open: bool,
    buffers: Vec<(Channel, Vec<i16>)>,
    fresh_capture: bool,
}

impl PicoScope {
    /// Loads the vendor driver; the unit itself is opened by `open`.
    pub fn connect() -> Result<Self> {
        let api = PsospaApi::instance()?;
        info!("psospa driver loaded");
        Ok(Self {
            api,
            handle: 0,
            open: false,
            buffers: Vec::new(),
            fresh_capture: true,
        })
    }
}

impl ScopeDevice for PicoScope {
    fn open(&mut self, resolution: Resolution) -> DeviceStatus {
        let mut handle: i16 = 0;
        let status = unsafe {
            (self.api.open_unit)(&mut handle, ptr::null_mut(), resolution.code(), ptr::null_mut())
        };
        let status = DeviceStatus(status);
        if status.is_ok() {
            self.handle = handle;
            self.open = true;
        }
        status
    }

    fn set_channel(&mut self, channel: Channel, setup: Option<&ChannelSetup>) -> DeviceStatus {
        let status = match setup {
            Some(setup) => {
                let range_nv = (setup.range_mv * 1_000_000.0) as i64;
                let bandwidth = match setup.bandwidth {
                    Bandwidth::Full => 0,
                    Bandwidth::Limited => BANDWIDTH_20MHZ,
                };
                unsafe {
                    (self.api.set_channel_on)(
                        self.handle,
                        channel_id(channel),
                        coupling_code(setup.coupling),
                        -range_nv,
                        range_nv,
                        PROBE_NONE_NV,
                        setup.analog_offset_v,
                        bandwidth,
                    )
                }
            }
            None => unsafe { (self.api.set_channel_off)(self.handle, channel_id(channel)) },
        };
        DeviceStatus(status)
    }

    fn max_adc(&mut self, resolution: Resolution) -> Result<i16, DeviceStatus> {
        let mut max: i16 = 0;
        let status = unsafe {
            (self.api.get_adc_limits)(self.handle, resolution.code(), ptr::null_mut(), &mut max)
        };
        let status = DeviceStatus(status);
        if status.is_ok() {
            Ok(max)
        } else {
            Err(status)
        }
    }

    fn set_trigger(&mut self, trigger: &TriggerSpec) -> DeviceStatus {
        match trigger {
            TriggerSpec::Simple {
                channel,
                threshold,
                direction,
                delay,
                auto_trigger_us,
            } => DeviceStatus(unsafe {
                (self.api.set_simple_trigger)(
                    self.handle,
                    1,
                    channel_id(*channel),
                    *threshold,
                    direction_code(*direction),
                    *delay,
                    *auto_trigger_us,
                )
            }),
            TriggerSpec::Advanced {
                conditions,
                directions,
                properties,
                delay,
                auto_trigger_us,
            } => {
                let conditions: Vec<PicoCondition> = conditions
                    .iter()
                    .map(|c| PicoCondition {
                        source: channel_id(c.channel),
                        condition: if c.active { CONDITION_TRUE } else { 0 },
                    })
                    .collect();
                let directions: Vec<PicoDirection> = directions
                    .iter()
                    .map(|d| PicoDirection {
                        channel: channel_id(d.channel),
                        direction: direction_code(d.direction),
                        threshold_mode: THRESHOLD_MODE_LEVEL,
                    })
                    .collect();
                let properties: Vec<PicoTriggerChannelProperties> = properties
                    .iter()
                    .map(|p| PicoTriggerChannelProperties {
                        threshold_upper: p.threshold_upper,
                        threshold_upper_hysteresis: p.hysteresis_upper,
                        threshold_lower: 0,
                        threshold_lower_hysteresis: 0,
                        channel: channel_id(p.channel),
                    })
                    .collect();
                let steps = unsafe {
                    [
                        (self.api.set_trigger_channel_conditions)(
                            self.handle,
                            conditions.as_ptr(),
                            conditions.len() as i16,
                            ACTION_CLEAR_ALL | ACTION_ADD,
                        ),
                        (self.api.set_trigger_channel_directions)(
                            self.handle,
                            directions.as_ptr(),
                            directions.len() as i16,
                        ),
                        (self.api.set_trigger_channel_properties)(
                            self.handle,
                            properties.as_ptr(),
                            properties.len() as i16,
                            *auto_trigger_us,
                        ),
                        (self.api.set_trigger_delay)(self.handle, *delay),
                    ]
                };
                steps
                    .into_iter()
                    .map(DeviceStatus)
                    .find(|s| !s.is_ok())
                    .unwrap_or(DeviceStatus::OK)
            }
        }
    }

    fn minimum_timebase(
        &mut self,
        enabled_mask: u32,
        resolution: Resolution,
    ) -> Result<Timebase, DeviceStatus> {
        let mut timebase: u32 = 0;
        let mut interval_s: c_double = 0.0;
        let status = DeviceStatus(unsafe {
            (self.api.get_minimum_timebase_stateless)(
                self.handle,
                enabled_mask,
                &mut timebase,
                &mut interval_s,
                resolution.code(),
            )
        });
        if !status.is_ok() {
            return Err(status);
        }
        Ok(Timebase {
            timebase,
            interval_ns: interval_s * 1e9,
        })
    }

    fn timebase(&mut self, timebase: u32, samples: usize) -> Result<Timebase, DeviceStatus> {
        let mut interval_ns: c_double = 0.0;
        let mut max_samples: u64 = 0;
        let status = DeviceStatus(unsafe {
            (self.api.get_timebase)(
                self.handle,
                timebase,
                samples as u64,
                &mut interval_ns,
                &mut max_samples,
                0,
            )
        });
        if !status.is_ok() {
            return Err(status);
        }
        debug!("timebase {timebase}: {interval_ns} ns, up to {max_samples} samples");
        Ok(Timebase {
            timebase,
            interval_ns,
        })
    }

    fn run_block(&mut self, pre: usize, post: usize, timebase: u32) -> DeviceStatus {
        self.fresh_capture = true;
        DeviceStatus(unsafe {
            (self.api.run_block)(
                self.handle,
                pre as u64,
                post as u64,
                timebase,
                ptr::null_mut(),
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        })
    }

    fn is_ready(&mut self) -> Result<bool, DeviceStatus> {
        let mut ready: i16 = 0;
        let status = DeviceStatus(unsafe { (self.api.is_ready)(self.handle, &mut ready) });
        if status.is_ok() {
            Ok(ready != 0)
        } else {
            Err(status)
        }
    }

    fn bind_buffer(&mut self, channel: Channel, len: usize) -> DeviceStatus {
        let mut buffer = vec![0i16; len];
        let action = if self.fresh_capture {
            ACTION_CLEAR_ALL | ACTION_ADD
        } else {
            ACTION_ADD
        };
        let status = DeviceStatus(unsafe {
            (self.api.set_data_buffer)(
                self.handle,
                channel_id(channel),
                buffer.as_mut_ptr() as *mut c_void,
                len as i32,
                DATA_TYPE_INT16,
                0,
                RATIO_MODE_RAW,
                action,
            )
        });
        if status.is_ok() {
            if self.fresh_capture {
                self.buffers.clear();
                self.fresh_capture = false;
            }
            // the heap block stays put when the Vec itself moves
            self.buffers.push((channel, buffer));
        }
        status
    }

    fn retrieve_values(&mut self) -> Result<RawCapture, DeviceStatus> {
        let mut samples = self
            .buffers
            .iter()
            .map(|(_, b)| b.len() as u64)
            .min()
            .unwrap_or(0);
        let mut overflow: i16 = 0;
        let status = DeviceStatus(unsafe {
            (self.api.get_values)(self.handle, 0, &mut samples, 1, RATIO_MODE_RAW, 0, &mut overflow)
        });
        if !status.is_ok() {
            return Err(status);
        }
        Ok(RawCapture {
            sample_count: samples as usize,
            overflow: overflow as u16,
            buffers: self.buffers.clone(),
        })
    }

    fn stop(&mut self) -> DeviceStatus {
        DeviceStatus(unsafe { (self.api.stop)(self.handle) })
    }

    fn close(&mut self) {
        if self.open {
            let status = DeviceStatus(unsafe { (self.api.close_unit)(self.handle) });
            debug!("close unit {}: {status}", self.handle);
            self.open = false;
        }
    }
}
