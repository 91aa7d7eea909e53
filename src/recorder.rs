// src/recorder.rs
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{info, warn};
use serde_json::Value;

use crate::acquisition::{AcquisitionError, CaptureRecord, Measurement, Mode};
use crate::config::{OutputSettings, Settings};
use crate::types::DataFormat;

fn persistence(path: &Path) -> impl FnOnce(std::io::Error) -> AcquisitionError + '_ {
    move |source| AcquisitionError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

fn run_stem(output: &OutputSettings, started: &DateTime<Local>) -> String {
    format!("{}_{}", output.filename, started.format("%Y-%m-%d_%H-%M-%S"))
}

/// Append-only measurement table, one row per successful capture.
pub struct DataRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    format: DataFormat,
    output: OutputSettings,
}

impl DataRecorder {
    pub fn data_path(output: &OutputSettings, started: &DateTime<Local>) -> PathBuf {
        output.data_dir.join(format!(
            "{}_data.{}",
            run_stem(output, started),
            output.format.extension()
        ))
    }

    /// 在数据目录下新建数据文件并写入表头
    pub fn create(settings: &Settings, started: &DateTime<Local>) -> Result<Self, AcquisitionError> {
        let output = &settings.output;
        fs::create_dir_all(&output.data_dir).map_err(persistence(&output.data_dir))?;
        Self::create_at(Self::data_path(output, started), settings.mode, output)
    }

    pub fn create_at(path: PathBuf, mode: Mode, output: &OutputSettings) -> Result<Self, AcquisitionError> {
        let file = File::create(&path).map_err(persistence(&path))?;
        let mut recorder = Self {
            writer: BufWriter::new(file),
            path,
            format: output.format,
            output: output.clone(),
        };
        let header = Self::header(mode, output);
        recorder.write_row(&header)?;
        info!("💾 Recording to {}", recorder.path.display());
        Ok(recorder)
    }

    pub fn header(mode: Mode, output: &OutputSettings) -> Vec<String> {
        let mut header = Vec::new();
        if output.include_counter {
            header.push("n".to_owned());
        }
        match mode {
            Mode::Charge => {
                if output.include_amplitude {
                    header.push("amplitude (mV)".to_owned());
                }
                if output.include_peak_to_peak {
                    header.push("peak2peak (mV)".to_owned());
                }
                header.push("charge (pC)".to_owned());
            }
            Mode::TimeDifference | Mode::MeanDelay => header.push("deltaT (ns)".to_owned()),
        }
        header
    }

    pub fn append(&mut self, record: &CaptureRecord) -> Result<(), AcquisitionError> {
        let mut row = Vec::new();
        if self.output.include_counter {
            row.push(record.index.to_string());
        }
        match record.measurement {
            Measurement::Charge {
                value,
                amplitude,
                peak_to_peak,
            } => {
                if self.output.include_amplitude {
                    row.push(format!("{amplitude:.9}"));
                }
                if self.output.include_peak_to_peak {
                    row.push(format!("{peak_to_peak:.9}"));
                }
                row.push(format!("{value:.9}"));
            }
            Measurement::TimeDifference { value } | Measurement::MeanDelay { value } => {
                row.push(format!("{value:.9}"))
            }
        }
        self.write_row(&row)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_row(&mut self, cells: &[String]) -> Result<(), AcquisitionError> {
        let line = cells.join(&self.format.separator().to_string());
        let path = self.path.clone();
        writeln!(self.writer, "{line}").map_err(persistence(&path))?;
        self.writer.flush().map_err(persistence(&path))
    }
}

/// Optional human-readable run journal next to the data file.
pub struct RunLog {
    file: File,
    path: PathBuf,
    warned: bool,
}

impl RunLog {
    pub fn log_path(output: &OutputSettings, started: &DateTime<Local>) -> PathBuf {
        output
            .data_dir
            .join(format!("{}_log.txt", run_stem(output, started)))
    }

    pub fn create(path: PathBuf) -> Result<Self, AcquisitionError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(persistence(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(persistence(&path))?;
        Ok(Self {
            file,
            path,
            warned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one entry, optionally prefixed with the local time. Failures are warned about once.
    pub fn entry(&mut self, text: &str, stamped: bool) {
        let line = if stamped {
            format!("[{}] {text}", Local::now().format("%Y-%m-%d %H:%M:%S"))
        } else {
            text.to_owned()
        };
        let result = writeln!(self.file, "{line}").and_then(|_| self.file.flush());
        if let Err(err) = result {
            if !self.warned {
                warn!("run log {} is not writable: {err}", self.path.display());
                self.warned = true;
            }
        }
    }

    pub fn parameters(&mut self, settings: &Settings) {
        self.entry("==> Running acquisition with parameters:", true);
        let mut pairs = Vec::new();
        match serde_json::to_value(settings) {
            Ok(value) => flatten("", &value, &mut pairs),
            Err(err) => pairs.push(("error".to_owned(), err.to_string())),
        }
        let width = pairs.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in pairs {
            self.entry(&format!("    {key:<width$} {value}"), false);
        }
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                flatten(&join(key), inner, out);
            }
        }
        Value::Array(items) if items.iter().any(|v| v.is_object()) => {
            for (i, inner) in items.iter().enumerate() {
                flatten(&join(&i.to_string()), inner, out);
            }
        }
        Value::String(text) => out.push((prefix.to_owned(), text.clone())),
        other => out.push((prefix.to_owned(), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(index: u64, measurement: Measurement) -> CaptureRecord {
        CaptureRecord { index, measurement }
    }

    #[test]
    fn charge_rows_follow_header_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.output.data_dir = dir.path().to_path_buf();
        settings.output.filename = "unit".into();
        settings.output.include_peak_to_peak = false;
        let started = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let mut recorder = DataRecorder::create(&settings, &started).unwrap();
        assert!(recorder
            .path()
            .ends_with("unit_2024-03-09_14-05-07_data.txt"));
        recorder
            .append(&record(
                1,
                Measurement::Charge {
                    value: 2.4,
                    amplitude: 40.0,
                    peak_to_peak: 40.0,
                },
            ))
            .unwrap();

        let text = fs::read_to_string(recorder.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "n\tamplitude (mV)\tcharge (pC)");
        assert_eq!(lines[1], "1\t40.000000000\t2.400000000");
    }

    #[test]
    fn csv_delay_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut output = Settings::default().output;
        output.format = DataFormat::Csv;
        let path = dir.path().join("d.csv");
        let mut recorder = DataRecorder::create_at(path.clone(), Mode::MeanDelay, &output).unwrap();
        recorder
            .append(&record(7, Measurement::MeanDelay { value: -1.25 }))
            .unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text, "n,deltaT (ns)\n7,-1.250000000\n");
    }

    #[test]
    fn run_log_lists_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run_log.txt");
        let mut log = RunLog::create(path.clone()).unwrap();
        log.parameters(&Settings::default());
        log.entry("Ok!", false);
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("==> Running acquisition with parameters:"));
        assert!(text.contains("threshold_mv"));
        assert!(text.contains("channels.0.enabled"));
        assert!(text.trim_end().ends_with("Ok!"));
    }

    #[test]
    fn unwritable_data_dir_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let mut settings = Settings::default();
        settings.output.data_dir = blocker.join("sub");
        let err = DataRecorder::create(&settings, &Local::now()).err().unwrap();
        assert!(matches!(err, AcquisitionError::Persistence { .. }));
    }
}
