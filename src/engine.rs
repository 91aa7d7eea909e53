// src/engine.rs
use anyhow::{Context, Result};
use chrono::Local;
use log::{info, warn};

use crate::acquisition::{
    transport_queue, Acquisition, CancelToken, CaptureLoop, CaptureSession, HistogramBuffer,
    HistogramSink, LiveAggregator, PicoScope, ScopeDevice, SimulatedScope, Snapshot,
};
use crate::config::Settings;
use crate::recorder::{DataRecorder, RunLog};
use crate::types::Backend;

/// Device type shared by every backend at the application level.
pub type DynScope = Box<dyn ScopeDevice>;

pub fn open_device(backend: Backend) -> Result<DynScope> {
    match backend {
        Backend::Simulated => {
            let seed = Local::now().timestamp_nanos_opt().unwrap_or_default() as u64;
            info!("🧪 Using simulated digitizer (seed {seed})");
            Ok(Box::new(SimulatedScope::new(seed).with_timeout_ratio(0.05)))
        }
        Backend::PicoScope => {
            let scope = PicoScope::connect().context("cannot use the PicoScope backend")?;
            Ok(Box::new(scope))
        }
    }
}

fn session(settings: &Settings, device: DynScope, started: &chrono::DateTime<Local>) -> CaptureSession<DynScope> {
    let mut session = CaptureSession::new(device, settings.clone());
    if settings.output.log {
        // 日志文件写不了不影响采集
        match RunLog::create(RunLog::log_path(&settings.output, started)) {
            Ok(log) => {
                info!("📝 Run log: {}", log.path().display());
                session = session.with_log(log);
            }
            Err(err) => warn!("run log disabled: {err}"),
        }
    }
    session
}

/// 初始化设备并启动采集线程，返回在调用线程上运行的直方图聚合器
pub fn start<S: HistogramSink>(
    settings: &Settings,
    device: DynScope,
    sink: S,
    capture_limit: Option<u64>,
) -> Result<LiveAggregator<DynScope, S>> {
    let started = Local::now();
    let cancel = CancelToken::new();
    let histogram = HistogramBuffer::new(
        settings.histogram.min,
        settings.histogram.max,
        settings.histogram.bins,
    )?;

    let mut session = session(settings, device, &started).with_cancel(cancel.clone());
    session.setup().context("device setup failed")?;
    let recorder = DataRecorder::create(settings, &started)?;

    let (tx, rx) = transport_queue(settings.queue_capacity, cancel.clone());
    let handle = CaptureLoop::new(session, tx, cancel)
        .with_recorder(recorder)
        .with_max_timeouts(settings.max_timeouts)
        .with_capture_limit(capture_limit)
        .spawn()
        .context("cannot spawn the capture thread")?;
    info!("▶ {} acquisition running", settings.mode);
    Ok(LiveAggregator::new(rx, handle, histogram, sink))
}

/// One diagnostic capture; the device is released before returning.
pub fn probe(settings: &Settings, device: DynScope) -> Result<Acquisition> {
    let mut session = CaptureSession::new(device, settings.clone());
    session.setup().context("device setup failed")?;
    let result = session.probe();
    session.stop().context("device stop failed")?;
    Ok(result?)
}

/// Headless sink: keeps the latest drawing and reports progress on the console.
#[derive(Default)]
pub struct ProgressSink {
    pub snapshot: Snapshot,
}

impl HistogramSink for ProgressSink {
    fn redraw_bins(&mut self, edges: &[f64], counts: &[u64]) {
        self.snapshot.redraw_bins(edges, counts);
        let total: u64 = counts.iter().sum();
        let tallest = counts.iter().copied().max().unwrap_or(0);
        info!("📊 {total} in range, tallest bin {tallest}");
    }

    fn redraw_axis(&mut self, max: u64, ticks: &[u64]) {
        self.snapshot.redraw_axis(max, ticks);
    }
}
