use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::acquisition::buffer::{CountAxis, HistogramBuffer};
use crate::acquisition::device::{DeviceStatus, ScopeDevice};
use crate::acquisition::error::AcquisitionError;
use crate::acquisition::pipeline::{CaptureReport, LoopExit};
use crate::acquisition::queue::{CancelToken, QueueReceiver, Received};
use crate::acquisition::session::CaptureRecord;

/// Bins are recomputed after this many new measurements.
pub const REDRAW_EVERY: u64 = 5;
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(5);

/// Whatever displays the live histogram.
pub trait HistogramSink {
    fn redraw_bins(&mut self, edges: &[f64], counts: &[u64]);
    fn redraw_axis(&mut self, max: u64, ticks: &[u64]);
}

/// Keeps only the latest drawing; handy for headless runs and tests.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
    pub axis_max: u64,
    pub ticks: Vec<u64>,
    pub bin_redraws: u64,
    pub axis_redraws: u64,
}

impl HistogramSink for Snapshot {
    fn redraw_bins(&mut self, edges: &[f64], counts: &[u64]) {
        self.edges = edges.to_vec();
        self.counts = counts.to_vec();
        self.bin_redraws += 1;
    }

    fn redraw_axis(&mut self, max: u64, ticks: &[u64]) {
        self.axis_max = max;
        self.ticks = ticks.to_vec();
        self.axis_redraws += 1;
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub exit: LoopExit,
    pub captured: u64,
    pub timeouts: u64,
    pub received: u64,
}

/// Consumer side: drains the queue into the histogram and owns shutdown.
pub struct LiveAggregator<D: ScopeDevice + 'static, S: HistogramSink> {
    receiver: QueueReceiver<CaptureRecord>,
    cancel: CancelToken,
    producer: Option<JoinHandle<CaptureReport<D>>>,
    histogram: HistogramBuffer,
    axis: CountAxis,
    sink: S,
    received: u64,
    last_index: Option<u64>,
    stop_wait: Duration,
}

impl<D: ScopeDevice + 'static, S: HistogramSink> LiveAggregator<D, S> {
    pub fn new(
        receiver: QueueReceiver<CaptureRecord>,
        producer: JoinHandle<CaptureReport<D>>,
        histogram: HistogramBuffer,
        mut sink: S,
    ) -> Self {
        let axis = CountAxis::default();
        sink.redraw_axis(axis.max(), &axis.ticks());
        Self {
            cancel: receiver.cancel_token().clone(),
            receiver,
            producer: Some(producer),
            histogram,
            axis,
            sink,
            received: 0,
            last_index: None,
            stop_wait: DEFAULT_STOP_WAIT,
        }
    }

    pub fn with_stop_wait(mut self, wait: Duration) -> Self {
        self.stop_wait = wait;
        self
    }

    pub fn histogram(&self) -> &HistogramBuffer {
        &self.histogram
    }

    pub fn axis(&self) -> &CountAxis {
        &self.axis
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_running(&self) -> bool {
        self.producer.is_some()
    }

    /// True once the producer cancelled the run by itself or someone asked to stop.
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn ingest(&mut self, record: CaptureRecord) {
        if let Some(last) = self.last_index {
            if record.index <= last {
                warn!("capture {} arrived after {last}", record.index);
            }
        }
        self.last_index = Some(record.index);
        self.histogram.push(record.measurement.value());
        self.received += 1;
        if self.received % REDRAW_EVERY == 0 {
            self.redraw();
        }
    }

    pub fn redraw(&mut self) {
        let counts = self.histogram.counts();
        self.sink.redraw_bins(&self.histogram.edges(), &counts);
        let tallest = counts.iter().copied().max().unwrap_or(0);
        if self.axis.grow_if_needed(tallest) {
            debug!("count axis grown to {}", self.axis.max());
            self.sink.redraw_axis(self.axis.max(), &self.axis.ticks());
        }
    }

    /// Applies a new binning to everything received so far.
    pub fn rebin(&mut self, min: f64, max: f64, bins: usize) -> Result<(), AcquisitionError> {
        self.histogram.set_binning(min, max, bins)?;
        self.axis.reset();
        self.sink.redraw_axis(self.axis.max(), &self.axis.ticks());
        self.redraw();
        Ok(())
    }

    /// Takes whatever is queued without blocking. Returns how many items arrived.
    pub fn poll(&mut self) -> usize {
        let mut taken = 0;
        while let Some(record) = self.receiver.try_recv() {
            self.ingest(record);
            taken += 1;
        }
        taken
    }

    /// Blocks until the run is cancelled or the producer goes away, then shuts it down.
    pub fn run(&mut self) -> Result<RunSummary, AcquisitionError> {
        loop {
            match self.receiver.recv() {
                Received::Item(record) => self.ingest(record),
                Received::Cancelled | Received::Closed => break,
            }
        }
        self.stop()
    }

    /// Cancels, keeps draining while the capture thread winds down, then stops the session.
    pub fn stop(&mut self) -> Result<RunSummary, AcquisitionError> {
        let Some(producer) = self.producer.take() else {
            return Err(AcquisitionError::InvalidState {
                state: "stopped",
                operation: "stop",
            });
        };
        self.cancel.cancel();

        let deadline = Instant::now() + self.stop_wait;
        while !producer.is_finished() {
            self.poll();
            if Instant::now() >= deadline {
                error!("capture thread did not stop within {:?}", self.stop_wait);
                return Err(AcquisitionError::device(
                    "join capture thread",
                    DeviceStatus::NOT_RESPONDING,
                ));
            }
            thread::sleep(Duration::from_millis(5));
        }

        let report = producer.join().map_err(|_| {
            error!("capture thread panicked");
            AcquisitionError::device("join capture thread", DeviceStatus::OPERATION_FAILED)
        })?;
        self.poll();
        self.redraw();

        let CaptureReport {
            mut session,
            mut exit,
            captured,
            timeouts,
        } = report;
        if let Err(err) = session.stop() {
            warn!("stopping the device failed: {err}");
            if !exit.is_failure() {
                exit = LoopExit::Failed(err);
            }
        }
        info!(
            "run finished: {captured} captured, {timeouts} timeouts, {} received",
            self.received
        );
        Ok(RunSummary {
            exit,
            captured,
            timeouts,
            received: self.received,
        })
    }
}

impl<D: ScopeDevice + 'static, S: HistogramSink> Drop for LiveAggregator<D, S> {
    fn drop(&mut self) {
        if self.producer.is_some() {
            if let Err(err) = self.stop() {
                error!("shutting down on drop: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::pipeline::CaptureLoop;
    use crate::acquisition::queue::transport_queue;
    use crate::acquisition::session::CaptureSession;
    use crate::acquisition::simulated::{record_from_millivolts, SimulatedScope};
    use crate::acquisition::device::RawCapture;
    use crate::config::Settings;
    use crate::types::Channel;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.mode = crate::acquisition::Mode::TimeDifference;
        s.targets = vec![Channel::A, Channel::C];
        s.channels[Channel::A.index()].range = 4;
        s.channels[Channel::C.index()].range = 4;
        s.threshold_mv = -20.0;
        s.pre_trigger_samples = 10;
        s.post_trigger_samples = 10;
        s.max_samples = 20;
        s
    }

    // channel C dips `shift` samples after channel A
    fn shifted(shift: usize) -> RawCapture {
        let mut a = vec![0.0; 20];
        let mut c = vec![0.0; 20];
        for (i, v) in [-10.0, -20.0, -40.0, -20.0, -10.0].iter().enumerate() {
            a[2 + i] = *v;
            c[2 + shift + i] = *v;
        }
        record_from_millivolts(&[(Channel::A, &a), (Channel::C, &c)], 200.0)
    }

    fn start(
        script: Vec<RawCapture>,
        limit: u64,
        capacity: usize,
    ) -> LiveAggregator<SimulatedScope, Snapshot> {
        let cancel = CancelToken::new();
        let (tx, rx) = transport_queue(capacity, cancel.clone());
        let mut session = CaptureSession::new(SimulatedScope::scripted(script), settings());
        session.setup().unwrap();
        let handle = CaptureLoop::new(session, tx, cancel)
            .with_capture_limit(Some(limit))
            .spawn()
            .unwrap();
        // bins of 0.4 ns, one per sample shift
        let histogram = HistogramBuffer::new(0.0, 4.0, 10).unwrap();
        LiveAggregator::new(rx, handle, histogram, Snapshot::default())
    }

    #[test]
    fn run_collects_everything_in_order() {
        let script: Vec<RawCapture> = (0..12).map(|i| shifted(i % 3)).collect();
        let mut aggregator = start(script, 12, 2);
        let summary = aggregator.run().unwrap();
        assert!(matches!(summary.exit, LoopExit::Completed));
        assert_eq!(summary.captured, 12);
        assert_eq!(summary.received, 12);
        assert_eq!(aggregator.histogram().len(), 12);
        let snapshot = aggregator.sink();
        assert_eq!(snapshot.counts.iter().sum::<u64>(), 12);
        assert_eq!(snapshot.counts[0] + snapshot.counts[1] + snapshot.counts[2], 12);
        // 5, 10 and the final redraw on stop
        assert_eq!(snapshot.bin_redraws, 3);
        assert!(!aggregator.is_running());
        assert!(aggregator.stop().is_err());
    }

    #[test]
    fn tall_bin_grows_the_axis() {
        let script: Vec<RawCapture> = (0..60).map(|_| shifted(1)).collect();
        let mut aggregator = start(script, 60, 64);
        let summary = aggregator.run().unwrap();
        assert_eq!(summary.received, 60);
        assert_eq!(aggregator.axis().max(), 70);
        assert_eq!(aggregator.sink().axis_max, 70);
        assert!(aggregator.sink().axis_redraws >= 2);
    }

    #[test]
    fn stop_while_running_drains_and_releases() {
        let script: Vec<RawCapture> = (0..500).map(|i| shifted(i % 4)).collect();
        let mut aggregator = start(script, 500, 4);
        while aggregator.received() < 8 {
            aggregator.poll();
            thread::sleep(Duration::from_millis(1));
        }
        let summary = aggregator.stop().unwrap();
        assert!(matches!(summary.exit, LoopExit::Cancelled | LoopExit::Completed));
        assert_eq!(summary.received, summary.captured);
    }

    #[test]
    fn rebin_redraws_existing_samples() {
        let script: Vec<RawCapture> = (0..5).map(|_| shifted(2)).collect();
        let mut aggregator = start(script, 5, 8);
        aggregator.run().unwrap();
        aggregator.rebin(0.0, 4.0, 2).unwrap();
        assert_eq!(aggregator.sink().counts, vec![5, 0]);
        assert!(aggregator.rebin(1.0, 0.0, 2).is_err());
    }
}
