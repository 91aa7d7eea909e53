use std::io;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::acquisition::device::ScopeDevice;
use crate::acquisition::error::AcquisitionError;
use crate::acquisition::queue::{CancelToken, QueueSender, SendError};
use crate::acquisition::session::{CaptureRecord, CaptureSession};
use crate::recorder::DataRecorder;

/// Consecutive capture timeouts tolerated before a run is declared failed.
pub const DEFAULT_MAX_TIMEOUTS: u32 = 5;

/// Why the capture loop returned.
#[derive(Debug)]
pub enum LoopExit {
    Cancelled,
    /// The capture limit was reached.
    Completed,
    Failed(AcquisitionError),
}

impl LoopExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, LoopExit::Failed(_))
    }
}

/// Handed back by the capture thread so the caller can stop the session.
pub struct CaptureReport<D: ScopeDevice> {
    pub session: CaptureSession<D>,
    pub exit: LoopExit,
    pub captured: u64,
    pub timeouts: u64,
}

/// Producer side: runs the session repeatedly and forwards each measurement.
pub struct CaptureLoop<D: ScopeDevice> {
    session: CaptureSession<D>,
    recorder: Option<DataRecorder>,
    queue: QueueSender<CaptureRecord>,
    cancel: CancelToken,
    max_timeouts: u32,
    capture_limit: Option<u64>,
}

impl<D: ScopeDevice + 'static> CaptureLoop<D> {
    pub fn new(
        session: CaptureSession<D>,
        queue: QueueSender<CaptureRecord>,
        cancel: CancelToken,
    ) -> Self {
        let max_timeouts = session.settings().max_timeouts.max(1);
        Self {
            session,
            recorder: None,
            queue,
            cancel,
            max_timeouts,
            capture_limit: None,
        }
    }

    pub fn with_recorder(mut self, recorder: DataRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_max_timeouts(mut self, max_timeouts: u32) -> Self {
        self.max_timeouts = max_timeouts.max(1);
        self
    }

    pub fn with_capture_limit(mut self, limit: Option<u64>) -> Self {
        self.capture_limit = limit;
        self
    }

    pub fn spawn(self) -> io::Result<JoinHandle<CaptureReport<D>>> {
        thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || self.run())
    }

    /// Runs until cancelled, completed or failed. Terminal failures cancel the whole run.
    pub fn run(mut self) -> CaptureReport<D> {
        let mut remaining = self.max_timeouts;
        let mut captured = 0u64;
        let mut timeouts = 0u64;

        let exit = loop {
            if self.cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }
            if self.capture_limit.is_some_and(|limit| captured >= limit) {
                info!("capture limit of {captured} reached");
                self.cancel.cancel();
                break LoopExit::Completed;
            }

            match self.session.run() {
                Ok(record) => {
                    remaining = self.max_timeouts;
                    // the row is written only once the aggregator holds the record
                    match self.queue.send(record) {
                        Ok(()) => captured += 1,
                        Err(SendError::Aborted(dropped)) => {
                            debug!("capture no. {} dropped on cancellation", dropped.index);
                            break LoopExit::Cancelled;
                        }
                        Err(SendError::Disconnected(_)) => {
                            warn!("aggregator went away; stopping capture");
                            break LoopExit::Cancelled;
                        }
                    }
                    if let Some(recorder) = self.recorder.as_mut() {
                        if let Err(err) = recorder.append(&record) {
                            break LoopExit::Failed(err);
                        }
                    }
                }
                Err(AcquisitionError::CaptureTimeout) => {
                    if self.cancel.is_cancelled() {
                        break LoopExit::Cancelled;
                    }
                    timeouts += 1;
                    remaining -= 1;
                    warn!("capture timed out ({remaining} retries left)");
                    if remaining == 0 {
                        break LoopExit::Failed(AcquisitionError::TimeoutBudgetExceeded(
                            self.max_timeouts,
                        ));
                    }
                }
                Err(err) => break LoopExit::Failed(err),
            }
        };

        match &exit {
            LoopExit::Failed(err) => {
                error!("capture loop failed: {err}");
                self.session
                    .log_entry(&format!("==> Job finished with error: {err}"), true);
                self.cancel.fail();
            }
            LoopExit::Cancelled | LoopExit::Completed => {
                let saved = self
                    .recorder
                    .as_ref()
                    .map(|r| r.path().display().to_string())
                    .unwrap_or_else(|| "(not recorded)".to_owned());
                self.session.log_entry(
                    &format!("==> Job finished without errors. Data saved to: {saved}"),
                    true,
                );
            }
        }

        CaptureReport {
            session: self.session,
            exit,
            captured,
            timeouts,
        }
    }
}
