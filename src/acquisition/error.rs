use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::acquisition::device::DeviceStatus;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{step} failed with status {status}")]
    Device {
        step: &'static str,
        status: DeviceStatus,
    },
    #[error("capture timed out without a threshold crossing")]
    CaptureTimeout,
    #[error("too many consecutive capture timeouts ({0})")]
    TimeoutBudgetExceeded(u32),
    #[error("cannot write {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },
    #[error("failed to render plot: {0}")]
    Plot(String),
}

impl AcquisitionError {
    pub fn device(step: &'static str, status: DeviceStatus) -> Self {
        AcquisitionError::Device { step, status }
    }

    /// Only a single missed trigger is worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AcquisitionError::CaptureTimeout)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for AcquisitionError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        AcquisitionError::Plot(format!("{value:?}"))
    }
}

impl From<image::ImageError> for AcquisitionError {
    fn from(value: image::ImageError) -> Self {
        AcquisitionError::Plot(value.to_string())
    }
}

/// Every problem found by one `setup` pass, in the order the steps ran.
#[derive(Debug, Default)]
pub struct SetupErrors(pub Vec<AcquisitionError>);

impl SetupErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, err: AcquisitionError) {
        self.0.push(err);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AcquisitionError> {
        self.0.iter()
    }
}

impl fmt::Display for SetupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "setup failed with {} error(s)", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SetupErrors {}
