//! The per-frame pipeline driven by stream events.
//!
//! The stream transport calls into [`FramePipeline`] from a single thread:
//!
//! ```text
//!  format changed ──► record format, (re)configure sink, reset warm-up
//!  buffer ready   ──► import ─► warm-up ─► validate ─► convert ─► write
//! ```
//!
//! Every pass returns a [`FrameOutcome`] and bumps a [`PipelineStats`]
//! counter, so each failure category is visible on its own. Buffers are
//! taken by value and dropped at the end of the pass, which requeues them.

use tracing::{debug, error, info, warn};

use crate::capture::buffer::StreamBuffer;
use crate::capture::convert::{ConversionBuffer, FormatConverter, layout_for};
use crate::capture::import::BufferImporter;
use crate::capture::sink::{DeviceSink, SinkFormat};
use crate::capture::types::{FrameView, StreamFormat};
use crate::capture::validate::{
    DEFAULT_MAX_SAMPLES, DEFAULT_MAX_WRITE_FAILURES, DEFAULT_MIN_VALID_RATIO,
    DEFAULT_WARMUP_FRAMES, FrameProbe, FrameValidator, WarmupGate, WriteTracker, WriteVerdict,
};
use crate::error::{CaptureError, ConvertError, ImportError};
use crate::portal::session::SessionLiveness;
use crate::shutdown::{Shutdown, ShutdownReason};

// ── Configuration ────────────────────────────────────────────────

/// Tunables for frame filtering and failure handling.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub warmup_frames: u32,
    pub min_valid_ratio: f64,
    pub max_samples: usize,
    pub max_write_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            min_valid_ratio: DEFAULT_MIN_VALID_RATIO,
            max_samples: DEFAULT_MAX_SAMPLES,
            max_write_failures: DEFAULT_MAX_WRITE_FAILURES,
        }
    }
}

// ── Events and outcomes ──────────────────────────────────────────

/// Stream states reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Error,
    Unconnected,
    Connecting,
    Paused,
    Streaming,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Unconnected => write!(f, "unconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Paused => write!(f, "paused"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// What happened to one buffer.
#[derive(Debug)]
pub enum FrameOutcome {
    /// The converted frame reached the sink.
    Written { bytes: usize },
    /// Dropped during warm-up.
    WarmingUp,
    /// Dropped as (nearly) black.
    Invalid,
    /// Arrived before any format was negotiated.
    NoFormat,
    /// The buffer carried no data plane.
    Empty,
    ImportFailed(ImportError),
    ConvertFailed(ConvertError),
    /// The sink rejected the frame.
    WriteFailed { consecutive: u32, shutdown: bool },
}

impl FrameOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Running per-category counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub buffers: u64,
    pub written: u64,
    pub warmup_skipped: u64,
    pub invalid: u64,
    pub no_format: u64,
    pub empty: u64,
    pub import_failures: u64,
    pub convert_failures: u64,
    pub write_failures: u64,
}

impl PipelineStats {
    fn record(&mut self, outcome: &FrameOutcome) {
        self.buffers += 1;
        let counter = match outcome {
            FrameOutcome::Written { .. } => &mut self.written,
            FrameOutcome::WarmingUp => &mut self.warmup_skipped,
            FrameOutcome::Invalid => &mut self.invalid,
            FrameOutcome::NoFormat => &mut self.no_format,
            FrameOutcome::Empty => &mut self.empty,
            FrameOutcome::ImportFailed(_) => &mut self.import_failures,
            FrameOutcome::ConvertFailed(_) => &mut self.convert_failures,
            FrameOutcome::WriteFailed { .. } => &mut self.write_failures,
        };
        *counter += 1;
    }
}

// ── FramePipeline ────────────────────────────────────────────────

/// Import, validate, convert and write, one buffer at a time.
pub struct FramePipeline<S: DeviceSink> {
    sink: S,
    importer: BufferImporter,
    converter: FormatConverter,
    validator: FrameValidator,
    warmup: WarmupGate,
    writes: WriteTracker,
    probe: FrameProbe,
    conversion: ConversionBuffer,
    format: Option<StreamFormat>,
    sink_format: Option<SinkFormat>,
    streaming: bool,
    liveness: SessionLiveness,
    shutdown: Shutdown,
    stats: PipelineStats,
}

impl<S: DeviceSink> FramePipeline<S> {
    pub fn new(
        sink: S,
        importer: BufferImporter,
        config: &PipelineConfig,
        liveness: SessionLiveness,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            sink,
            importer,
            converter: FormatConverter::new(),
            validator: FrameValidator::new(config.min_valid_ratio, config.max_samples),
            warmup: WarmupGate::new(config.warmup_frames),
            writes: WriteTracker::new(config.max_write_failures),
            probe: FrameProbe::default(),
            conversion: ConversionBuffer::new(),
            format: None,
            sink_format: None,
            streaming: false,
            liveness,
            shutdown,
            stats: PipelineStats::default(),
        }
    }

    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    // ── Stream events ────────────────────────────────────────────

    /// Apply a newly negotiated format.
    ///
    /// The sink is configured and the output buffer reallocated on the
    /// first format and on every dimension change. Warm-up always restarts.
    pub fn on_format_changed(&mut self, format: StreamFormat) -> Result<(), CaptureError> {
        if format.width == 0 || format.height == 0 {
            warn!(width = format.width, height = format.height, "ignoring empty video size");
            return Ok(());
        }

        match format.layout() {
            Some(layout) => info!(
                %layout,
                width = format.width,
                height = format.height,
                "stream format negotiated"
            ),
            None => warn!(
                format_id = format.format_id,
                "unsupported pixel format; frames will be dropped"
            ),
        }

        let previous = self.format.replace(format);
        self.warmup.reset();

        let resized = previous.is_none_or(|prev| !prev.same_dimensions(&format));
        if resized || self.sink_format.is_none() {
            self.conversion.resize(format.width, format.height)?;
            let sink_format = SinkFormat::yuyv(format.width, format.height);
            self.sink.configure(&sink_format)?;
            self.sink_format = Some(sink_format);
        }
        Ok(())
    }

    /// Accept the transport's buffer parameters.
    pub fn on_buffers_offered(&mut self, count: Option<u32>) {
        match count {
            Some(count) => debug!(count, "stream buffers negotiated"),
            None => debug!("stream buffers negotiated"),
        }
    }

    /// Log a stream state transition.
    pub fn on_state_changed(&mut self, old: StreamState, new: StreamState, message: Option<&str>) {
        self.streaming = new == StreamState::Streaming;
        match new {
            StreamState::Error => {
                let message = message.unwrap_or("unknown error");
                error!(%old, "stream error: {message}");
                if message.contains("no more input formats") {
                    warn!(
                        "the producer offered no format we accept; \
                         check that the screencast source supports raw RGB video \
                         and try restarting the desktop portal"
                    );
                }
            }
            StreamState::Streaming => info!(%old, "stream is live"),
            _ => info!(%old, %new, "stream state changed"),
        }
    }

    /// Run one buffer through the pipeline. The buffer is requeued when
    /// this returns.
    pub fn process<B: StreamBuffer>(&mut self, buffer: B) -> FrameOutcome {
        let outcome = self.process_buffer(&buffer);
        self.stats.record(&outcome);
        drop(buffer);
        outcome
    }

    fn process_buffer<B: StreamBuffer>(&mut self, buffer: &B) -> FrameOutcome {
        let Some(format) = self.format else {
            return FrameOutcome::NoFormat;
        };
        let Some(descriptor) = buffer.descriptor() else {
            return FrameOutcome::Empty;
        };

        let frame = match self.importer.import(&descriptor, &format) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(memory = descriptor.memory.name(), "skipping frame: {e}");
                return FrameOutcome::ImportFailed(e);
            }
        };

        if frame.layout_override.is_none() && frame.stride != format.stride {
            debug!(from = format.stride, to = frame.stride, "stride corrected from buffer");
            self.format = Some(StreamFormat {
                stride: frame.stride,
                ..format
            });
        }

        if !self.warmup.admit() {
            return FrameOutcome::WarmingUp;
        }

        let layout = match frame.layout_override {
            Some(layout) => layout,
            None => match layout_for(format.format_id) {
                Ok(layout) => layout,
                Err(e) => return FrameOutcome::ConvertFailed(e),
            },
        };
        let view = FrameView {
            data: frame.data(),
            width: format.width,
            height: format.height,
            stride: frame.stride,
            layout,
        };

        self.probe.observe(&view);
        if !self.validator.check(&view) {
            return FrameOutcome::Invalid;
        }

        if !self.conversion.matches(format.width, format.height) {
            if let Err(e) = self.conversion.resize(format.width, format.height) {
                return FrameOutcome::ConvertFailed(e);
            }
        }
        if let Err(e) = self.converter.convert(&view, self.conversion.as_mut_slice()) {
            warn!("conversion failed: {e}");
            return FrameOutcome::ConvertFailed(e);
        }
        drop(frame);

        self.write_converted()
    }

    fn write_converted(&mut self) -> FrameOutcome {
        let result = self.sink.write_frame(self.conversion.as_slice());
        let active = self.liveness.is_active();
        let verdict = self.writes.record(&result, active);

        match result {
            Ok(bytes) => {
                if bytes != 0 && bytes < self.conversion.len() {
                    debug!(bytes, expected = self.conversion.len(), "short write");
                }
                FrameOutcome::Written { bytes }
            }
            Err(e) => {
                let consecutive = self.writes.consecutive_failures();
                warn!(consecutive, "write to output device failed: {e}");
                let shutdown = verdict == WriteVerdict::Shutdown;
                if shutdown {
                    let reason = if active {
                        error!("output device keeps failing; stopping");
                        ShutdownReason::SinkFailed
                    } else {
                        ShutdownReason::SessionClosed
                    };
                    self.shutdown.request(reason);
                }
                FrameOutcome::WriteFailed {
                    consecutive,
                    shutdown,
                }
            }
        }
    }
}
