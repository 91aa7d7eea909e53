// src/config.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::acquisition::device::{Resolution, INPUT_RANGES_MV};
use crate::acquisition::Mode;
use crate::types::{Bandwidth, Channel, Coupling, DataFormat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected `key = value`, got `{text}`")]
    Syntax { line: usize, text: String },
    #[error("invalid `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_owned(),
            reason: reason.into(),
        }
    }
}

/// A raw value from the configuration file, typed by its textual form.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<i64>),
    Text(String),
}

impl ConfigValue {
    pub fn infer(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("true") {
            return ConfigValue::Bool(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return ConfigValue::Bool(false);
        }
        if let Ok(v) = raw.parse::<i64>() {
            return ConfigValue::Int(v);
        }
        if let Ok(v) = raw.parse::<f64>() {
            return ConfigValue::Float(v);
        }
        let inner = raw
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(raw);
        if inner.contains(',') {
            let parsed: Result<Vec<i64>, _> =
                inner.split(',').map(|part| part.trim().parse::<i64>()).collect();
            if let Ok(list) = parsed {
                return ConfigValue::List(list);
            }
        }
        let unquoted = raw
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(raw);
        ConfigValue::Text(unquoted.to_owned())
    }
}

/// Parsed `key = value` file, before any interpretation of the keys.
#[derive(Clone, Debug, Default)]
pub struct ConfigMap {
    entries: BTreeMap<String, ConfigValue>,
}

impl ConfigMap {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with(';')
                || (line.starts_with('[') && line.ends_with(']') && !line.contains('='))
            {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax {
                    line: number + 1,
                    text: line.to_owned(),
                });
            };
            entries.insert(key.trim().to_owned(), ConfigValue::infer(value));
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Int(v)) => Ok(Some(*v)),
            Some(ConfigValue::Bool(b)) => Ok(Some(*b as i64)),
            Some(other) => Err(ConfigError::invalid(key, format!("expected an integer, got {other:?}"))),
        }
    }

    fn unsigned(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.int(key)? {
            Some(v) if v < 0 => Err(ConfigError::invalid(key, "must not be negative")),
            other => Ok(other.map(|v| v as u64)),
        }
    }

    fn float(&self, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Int(v)) => Ok(Some(*v as f64)),
            Some(ConfigValue::Float(v)) => Ok(Some(*v)),
            Some(other) => Err(ConfigError::invalid(key, format!("expected a number, got {other:?}"))),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Bool(b)) => Ok(Some(*b)),
            Some(ConfigValue::Int(v)) => Ok(Some(*v != 0)),
            Some(ConfigValue::Text(t)) if t.eq_ignore_ascii_case("yes") => Ok(Some(true)),
            Some(ConfigValue::Text(t)) if t.eq_ignore_ascii_case("no") => Ok(Some(false)),
            Some(other) => Err(ConfigError::invalid(key, format!("expected a flag, got {other:?}"))),
        }
    }

    fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            ConfigValue::Text(t) => Some(t.clone()),
            ConfigValue::Int(v) => Some(v.to_string()),
            ConfigValue::Float(v) => Some(v.to_string()),
            ConfigValue::Bool(b) => Some(b.to_string()),
            ConfigValue::List(l) => Some(
                l.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub coupling: Coupling,
    /// Index into [`INPUT_RANGES_MV`].
    pub range: usize,
    pub analog_offset_v: f64,
    pub bandwidth: Bandwidth,
}

impl ChannelConfig {
    pub fn range_mv(&self) -> f64 {
        INPUT_RANGES_MV
            .get(self.range)
            .copied()
            .unwrap_or(INPUT_RANGES_MV[INPUT_RANGES_MV.len() - 1])
    }

    pub fn offset_mv(&self) -> f64 {
        self.analog_offset_v * 1000.0
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            coupling: Coupling::Dc50,
            range: 5,
            analog_offset_v: 0.0,
            bandwidth: Bandwidth::Full,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramSettings {
    pub min: f64,
    pub max: f64,
    pub bins: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutputSettings {
    pub data_dir: PathBuf,
    pub filename: String,
    pub format: DataFormat,
    pub include_counter: bool,
    pub include_amplitude: bool,
    pub include_peak_to_peak: bool,
    pub log: bool,
}

/// Typed acquisition parameters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Settings {
    pub mode: Mode,
    pub channels: [ChannelConfig; 4],
    pub targets: Vec<Channel>,
    /// Charge mode only: channel integrated for charge. Defaults to the first enabled non-gate channel.
    pub signal: Option<Channel>,
    pub threshold_mv: f64,
    pub auto_trigger_ms: u32,
    /// Trigger delay in sample periods.
    pub trigger_delay: u64,
    pub pre_trigger_samples: usize,
    pub post_trigger_samples: usize,
    pub max_samples: usize,
    pub timebase: Option<u32>,
    pub resolution: Resolution,
    pub histogram: HistogramSettings,
    pub max_timeouts: u32,
    pub queue_capacity: usize,
    pub output: OutputSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let mut channels: [ChannelConfig; 4] = Default::default();
        channels[Channel::A.index()].enabled = true;
        channels[Channel::C.index()].enabled = true;
        Self {
            mode: Mode::Charge,
            channels,
            targets: vec![Channel::A],
            signal: None,
            threshold_mv: -100.0,
            auto_trigger_ms: 1000,
            trigger_delay: 0,
            pre_trigger_samples: 50,
            post_trigger_samples: 250,
            max_samples: 300,
            timebase: None,
            resolution: Resolution::Bits8,
            histogram: HistogramSettings {
                min: 0.0,
                max: 100.0,
                bins: 100,
            },
            max_timeouts: 5,
            queue_capacity: 64,
            output: OutputSettings {
                data_dir: PathBuf::from("Data"),
                filename: "scopegate".to_owned(),
                format: DataFormat::Txt,
                include_counter: true,
                include_amplitude: true,
                include_peak_to_peak: true,
                log: false,
            },
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_map(&ConfigMap::load(path)?)
    }

    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let mut s = Settings::default();

        if let Some(mode) = map.text("mode") {
            s.mode = Mode::from_name(&mode)
                .ok_or_else(|| ConfigError::invalid("mode", format!("unknown mode `{mode}`")))?;
        }

        for ch in Channel::ALL {
            let cfg = &mut s.channels[ch.index()];
            let key = |field: &str| format!("ch{}{}", ch.letter(), field);
            if let Some(enabled) = map.flag(&key("enabled"))? {
                cfg.enabled = enabled;
            }
            let coupling_key = key("coupling");
            match map.get(&coupling_key) {
                None => {}
                Some(ConfigValue::Int(code)) => {
                    cfg.coupling = Coupling::from_code(*code).ok_or_else(|| {
                        ConfigError::invalid(&coupling_key, format!("unknown coupling code {code}"))
                    })?;
                }
                Some(ConfigValue::Text(name)) => {
                    cfg.coupling = Coupling::from_name(name).ok_or_else(|| {
                        ConfigError::invalid(&coupling_key, format!("unknown coupling `{name}`"))
                    })?;
                }
                Some(other) => {
                    return Err(ConfigError::invalid(&coupling_key, format!("unexpected {other:?}")))
                }
            }
            if let Some(range) = map.unsigned(&key("range"))? {
                cfg.range = range as usize;
            }
            if let Some(offset) = map.float(&key("analogOffset"))? {
                cfg.analog_offset_v = offset;
            }
            let bandwidth_key = key("bandwidth");
            if let Some(code) = map.int(&bandwidth_key)? {
                cfg.bandwidth = Bandwidth::from_code(code).ok_or_else(|| {
                    ConfigError::invalid(&bandwidth_key, format!("unknown bandwidth code {code}"))
                })?;
            }
        }

        if let Some(target) = map.text("target") {
            s.targets = parse_channels("target", &target)?;
        }
        if let Some(signal) = map.text("signal") {
            let mut parsed = parse_channels("signal", &signal)?;
            if parsed.len() != 1 {
                return Err(ConfigError::invalid("signal", "expected exactly one channel"));
            }
            s.signal = parsed.pop();
        }

        if let Some(v) = map.float("thresholdmV")? {
            s.threshold_mv = v;
        }
        if let Some(v) = map.unsigned("autoTrigms")? {
            s.auto_trigger_ms = v as u32;
        }
        if let Some(v) = map.unsigned("triggerDelay")?.or(map.unsigned("delaySeconds")?) {
            s.trigger_delay = v;
        }
        if let Some(v) = map.unsigned("preTrigSamples")? {
            s.pre_trigger_samples = v as usize;
        }
        if let Some(v) = map.unsigned("postTrigSamples")? {
            s.post_trigger_samples = v as usize;
        }
        s.max_samples = match map.unsigned("maxSamples")? {
            Some(v) => v as usize,
            None => s.pre_trigger_samples + s.post_trigger_samples,
        };
        // legacy `timebase` is informational; only `fixedTimebase` pins it
        s.timebase = map.unsigned("fixedTimebase")?.map(|v| v as u32);
        if s.timebase.is_none() {
            if let Some(legacy) = map.get("timebase") {
                debug!("timebase = {legacy:?} ignored; using the minimum timebase");
            }
        }
        if let Some(bits) = map.int("resolution")? {
            s.resolution = Resolution::from_bits(bits).ok_or_else(|| {
                ConfigError::invalid("resolution", format!("unsupported resolution {bits} bit"))
            })?;
        }

        match map.get("histBounds") {
            None => {}
            Some(ConfigValue::List(bounds)) if bounds.len() == 2 => {
                s.histogram.min = bounds[0] as f64;
                s.histogram.max = bounds[1] as f64;
            }
            Some(other) => {
                return Err(ConfigError::invalid(
                    "histBounds",
                    format!("expected two integers `min, max`, got {other:?}"),
                ))
            }
        }
        if let Some(v) = map.unsigned("histBins")? {
            s.histogram.bins = v as usize;
        }
        if let Some(v) = map.unsigned("maxTimeouts")? {
            s.max_timeouts = v as u32;
        }
        if let Some(v) = map.unsigned("queueCapacity")? {
            s.queue_capacity = v as usize;
        }

        if let Some(dir) = map.text("dataDir") {
            s.output.data_dir = PathBuf::from(dir);
        }
        if let Some(name) = map.text("filename") {
            s.output.filename = name;
        }
        if let Some(format) = map.text("dformat") {
            s.output.format = DataFormat::from_name(&format).ok_or_else(|| {
                ConfigError::invalid("dformat", format!("unknown data format `{format}`"))
            })?;
        }
        if let Some(v) = map.flag("includeCounter")? {
            s.output.include_counter = v;
        }
        if let Some(v) = map.flag("includeAmplitude")? {
            s.output.include_amplitude = v;
        }
        if let Some(v) = map.flag("includePeakToPeak")? {
            s.output.include_peak_to_peak = v;
        }
        if let Some(v) = map.flag("log")? {
            s.output.log = v;
        }

        Ok(s)
    }

    pub fn channel(&self, channel: Channel) -> &ChannelConfig {
        &self.channels[channel.index()]
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = Channel> + '_ {
        Channel::ALL
            .into_iter()
            .filter(|ch| self.channel(*ch).enabled)
    }

    pub fn enabled_mask(&self) -> u32 {
        self.enabled_channels().map(Channel::flag).sum()
    }

    /// Channel integrated in charge mode.
    pub fn signal_channel(&self) -> Option<Channel> {
        if let Some(signal) = self.signal {
            return Some(signal);
        }
        let gate = self.targets.first().copied();
        self.enabled_channels().find(|ch| Some(*ch) != gate)
    }

    /// Every inconsistency in the parameter set, in a stable order.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let expected = self.mode.target_count();
        if self.targets.len() != expected {
            problems.push(format!(
                "{} mode expects {} trigger target(s), got {}",
                self.mode,
                expected,
                self.targets.len()
            ));
        }
        for (i, t) in self.targets.iter().enumerate() {
            if self.targets[..i].contains(t) {
                problems.push(format!("channel {t} listed twice as a trigger target"));
            }
            if !self.channel(*t).enabled {
                problems.push(format!("trigger target channel {t} is disabled"));
            }
        }
        if self.mode == Mode::Charge {
            match self.signal_channel() {
                None => problems.push("charge mode needs an enabled signal channel besides the gate".to_owned()),
                Some(signal) if !self.channel(signal).enabled => {
                    problems.push(format!("signal channel {signal} is disabled"))
                }
                Some(signal) if self.targets.first() == Some(&signal) => {
                    problems.push(format!("signal channel {signal} is also the gate channel"))
                }
                Some(_) => {}
            }
        }
        for ch in Channel::ALL {
            let cfg = self.channel(ch);
            if cfg.range >= INPUT_RANGES_MV.len() {
                problems.push(format!(
                    "channel {ch} range index {} is outside 0..{}",
                    cfg.range,
                    INPUT_RANGES_MV.len()
                ));
            }
        }
        if self.pre_trigger_samples + self.post_trigger_samples == 0 {
            problems.push("record length is zero (pre + post trigger samples)".to_owned());
        }
        if self.max_samples < self.pre_trigger_samples + self.post_trigger_samples {
            problems.push(format!(
                "maxSamples {} is shorter than pre + post trigger samples {}",
                self.max_samples,
                self.pre_trigger_samples + self.post_trigger_samples
            ));
        }
        if !(self.histogram.min < self.histogram.max) {
            problems.push(format!(
                "histogram bounds [{}, {}] are empty",
                self.histogram.min, self.histogram.max
            ));
        }
        if self.histogram.bins == 0 {
            problems.push("histogram needs at least one bin".to_owned());
        }
        if self.max_timeouts == 0 {
            problems.push("maxTimeouts must be at least 1".to_owned());
        }
        if self.queue_capacity == 0 {
            problems.push("queueCapacity must be at least 1".to_owned());
        }
        problems
    }
}

fn parse_channels(key: &str, raw: &str) -> Result<Vec<Channel>, ConfigError> {
    raw.chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| {
            Channel::from_letter(c)
                .ok_or_else(|| ConfigError::invalid(key, format!("unknown channel `{c}`")))
        })
        .collect()
}
