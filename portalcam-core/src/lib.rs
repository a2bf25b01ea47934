//! # portalcam-core
//!
//! Desktop screencast to virtual webcam.
//!
//! This crate contains:
//! - **Portal**: `Negotiator` driving the screencast session handshake over a `PortalBus`
//! - **Capture**: `FramePipeline` turning stream buffers into YUYV loopback frames
//! - **Import**: `BufferImporter` for dma-buf, shared-memory and mapped buffers
//! - **Convert**: `FormatConverter` for ten packed RGB layouts
//! - **Sink**: `V4l2Loopback`, the `DeviceSink` for `v4l2loopback` devices
//! - **Shutdown**: `Shutdown`, a cancellation token with a first-wins reason
//! - **Error**: `CaptureError`, a typed, `thiserror`-based error hierarchy

pub mod capture;
pub mod error;
pub mod flags;
pub mod portal;
pub mod shutdown;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    BufferImporter, FormatConverter, FrameOutcome, FramePipeline, PipelineConfig, PixelLayout,
    SinkFormat, StreamFormat, V4l2Loopback,
};
pub use error::{CaptureError, ConvertError, GpuError, ImportError, PortalError, SinkError};
pub use flags::{DataFlags, SourceTypes};
pub use portal::{LiveSession, Negotiator, PortalBus, SessionLiveness, SourceSelection};
pub use shutdown::{Shutdown, ShutdownReason};
