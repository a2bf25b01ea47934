//! Domain-specific error types for the capture pipeline.
//!
//! Each pipeline stage owns its own error enum so a failing frame can be
//! attributed to exactly one category. `CaptureError` wraps them all for
//! callers that only need to propagate.

use thiserror::Error;

use crate::portal::session::HandshakeStep;

/// The canonical error type for setup and run-loop failures.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The portal handshake or session monitoring failed.
    #[error("portal error: {0}")]
    Portal(#[from] PortalError),

    /// A frame buffer could not be turned into linear pixels.
    #[error("import error: {0}")]
    Import(#[from] ImportError),

    /// Pixel conversion failed.
    #[error("conversion error: {0}")]
    Convert(#[from] ConvertError),

    /// The output device rejected an operation.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// The stream transport reported a failure.
    #[error("stream error: {0}")]
    Stream(String),
}

// ── PortalError ──────────────────────────────────────────────────

/// Failures of the session-broker handshake.
#[derive(Debug, Error)]
pub enum PortalError {
    /// The broker answered a request with a non-zero status.
    ///
    /// Status 1 means the user cancelled the dialog; 2 means any other
    /// broker-side failure.
    #[error("{step} request failed with status {status}")]
    RequestFailed { step: HandshakeStep, status: u32 },

    /// A successful response lacked a field required by its phase.
    #[error("{step} response is missing `{field}`")]
    MissingField {
        step: HandshakeStep,
        field: &'static str,
    },

    /// The broker closed the session.
    #[error("session closed by the broker")]
    SessionClosed,

    /// A state transition was attempted from the wrong phase.
    #[error("invalid handshake transition: {0}")]
    InvalidTransition(&'static str),

    /// The bus connection itself failed.
    #[error("bus error: {0}")]
    Bus(String),

    /// Shutdown was requested before the handshake completed.
    #[error("handshake cancelled")]
    Cancelled,
}

// ── ImportError ──────────────────────────────────────────────────

/// Reasons a buffer yielded no usable pixel region.
#[derive(Debug, Error)]
pub enum ImportError {
    /// A GPU-handle buffer was not flagged mappable and GPU import did
    /// not succeed.
    #[error("dma-buf is not mappable")]
    NotMappable,

    /// The buffer memory kind is not one we can read.
    #[error("unsupported buffer memory type {0}")]
    UnsupportedMemory(u32),

    /// Mapping the buffer's file descriptor failed.
    #[error("mmap failed: {0}")]
    Map(#[from] std::io::Error),

    /// The region is too short for the negotiated frame geometry.
    #[error("buffer region too small: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// No format has been negotiated yet.
    #[error("no stream format negotiated")]
    NoFormat,

    /// GPU import failed at a specific step.
    #[error("gpu import failed: {0}")]
    Gpu(#[from] GpuError),
}

/// Step-level failure of the GPU import path.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("graphics context: {0}")]
    Context(String),

    #[error("dma-buf import is not supported by this context")]
    Unsupported,

    #[error("failed to create image from dma-buf: {0}")]
    CreateImage(String),

    #[error("failed to bind texture: {0}")]
    BindTexture(String),

    #[error("framebuffer incomplete: status {0:#x}")]
    IncompleteFramebuffer(u32),

    #[error("readback buffer too small: need {needed}, have {available}")]
    ReadbackTooSmall { needed: usize, available: usize },

    #[error("readback failed: {0}")]
    ReadPixels(String),
}

// ── ConvertError ─────────────────────────────────────────────────

/// Failures of the pixel converter.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The stream format id is not one of the supported layouts.
    #[error("unsupported pixel layout {0}")]
    UnsupportedLayout(u32),

    /// A scratch or output buffer could not be allocated.
    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    /// The source region is shorter than the geometry requires.
    #[error("source too small: need {needed} bytes, have {actual}")]
    SourceTooSmall { needed: usize, actual: usize },

    /// The row pitch is shorter than one row of pixels.
    #[error("stride {stride} is below the {tight}-byte row width")]
    StrideTooSmall { stride: u32, tight: usize },

    /// The destination does not hold exactly one output frame.
    #[error("output buffer is {actual} bytes, expected {expected}")]
    OutputSize { expected: usize, actual: usize },
}

// ── SinkError ────────────────────────────────────────────────────

/// Failures of the virtual-camera device.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The device node could not be opened.
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A device control request was refused.
    #[error("{request} failed: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Writing a frame failed.
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = PortalError::RequestFailed {
            step: HandshakeStep::SelectSources,
            status: 1,
        };
        assert!(e.to_string().contains("SelectSources"));
        assert!(e.to_string().contains("status 1"));

        let e = ConvertError::OutputSize {
            expected: 100,
            actual: 50,
        };
        assert!(e.to_string().contains("100"));
        assert!(e.to_string().contains("50"));
    }

    #[test]
    fn stage_errors_wrap_into_capture_error() {
        let e: CaptureError = ImportError::NotMappable.into();
        assert!(matches!(e, CaptureError::Import(ImportError::NotMappable)));

        let e: CaptureError = ConvertError::UnsupportedLayout(99).into();
        assert!(e.to_string().contains("99"));
    }

    #[test]
    fn gpu_error_wraps_into_import_error() {
        let e: ImportError = GpuError::IncompleteFramebuffer(0x8cd6).into();
        assert!(matches!(e, ImportError::Gpu(_)));
        assert!(e.to_string().contains("0x8cd6"));
    }
}
