// src/acquisition/mod.rs
// 采集核心：设备抽象、门限检测、测量计算、采集会话与生产者/消费者管线
pub mod aggregator;
pub mod buffer;
pub mod device;
pub mod error;
pub mod gate;
pub mod measurement;
pub mod picoscope;
pub mod pipeline;
pub mod plot;
pub mod queue;
pub mod session;
pub mod simulated;
pub mod waveform;
// 公开导出常用类型，方便外部调用
pub use aggregator::{HistogramSink, LiveAggregator, RunSummary, Snapshot, REDRAW_EVERY};
pub use buffer::{CountAxis, HistogramBuffer};
pub use device::{DeviceStatus, RawCapture, Resolution, ScopeDevice, TriggerSpec};
pub use error::{AcquisitionError, SetupErrors};
pub use gate::{detect_gate, Crossing, Gate};
pub use measurement::Measurement;
pub use picoscope::PicoScope;
pub use pipeline::{CaptureLoop, CaptureReport, LoopExit, DEFAULT_MAX_TIMEOUTS};
pub use plot::{render_histogram_png, render_probe_png, PlotStyle};
pub use queue::{transport_queue, CancelToken, QueueReceiver, QueueSender, Received};
pub use session::{Acquisition, CaptureRecord, CaptureSession, Mode, SessionState, Threshold};
pub use simulated::SimulatedScope;
pub use waveform::Waveform;
