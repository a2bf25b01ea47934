//! Virtual-camera output.
//!
//! [`DeviceSink`] is the narrow seam the pipeline writes through;
//! [`V4l2Loopback`] implements it for a v4l2loopback device node, using
//! the `v4l` crate for format negotiation and `write(2)` for frames.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use v4l::capability::{Capabilities, Flags as CapabilityFlags};
use v4l::format::{Colorspace, FieldOrder};
use v4l::video::{Capture, Output};
use v4l::{Device, Format, FourCC};

use crate::error::SinkError;

// ── SinkFormat ───────────────────────────────────────────────────

/// Output pixel formats the sink can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPixelFormat {
    /// Packed 4:2:2, two bytes per pixel.
    Yuyv,
    /// 32-bit x:R:G:B little-endian; pattern-mode fallback only.
    Xrgb32,
}

impl OutputPixelFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            OutputPixelFormat::Yuyv => 2,
            OutputPixelFormat::Xrgb32 => 4,
        }
    }

    pub fn fourcc(self) -> FourCC {
        match self {
            OutputPixelFormat::Yuyv => FourCC::new(b"YUYV"),
            OutputPixelFormat::Xrgb32 => FourCC::new(b"XR24"),
        }
    }
}

/// Geometry and pixel format written to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: OutputPixelFormat,
}

impl SinkFormat {
    pub fn yuyv(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_format: OutputPixelFormat::Yuyv,
        }
    }

    pub fn bytes_per_line(&self) -> u32 {
        self.width * self.pixel_format.bytes_per_pixel()
    }

    pub fn frame_size(&self) -> usize {
        self.bytes_per_line() as usize * self.height as usize
    }
}

/// A device that accepts fixed-size frames.
pub trait DeviceSink: Send {
    /// Announce the frame geometry. Called before the first write and
    /// again whenever dimensions change.
    fn configure(&mut self, format: &SinkFormat) -> Result<(), SinkError>;

    /// Write one frame; returns bytes accepted.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize>;
}

// ── V4l2Loopback ─────────────────────────────────────────────────

/// Driver-reported identity and capabilities.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub capabilities: CapabilityFlags,
}

impl DeviceCapabilities {
    pub fn supports_output(&self) -> bool {
        self.capabilities.contains(CapabilityFlags::VIDEO_OUTPUT)
    }

    pub fn supports_capture(&self) -> bool {
        self.capabilities.contains(CapabilityFlags::VIDEO_CAPTURE)
    }

    pub fn supports_read_write(&self) -> bool {
        self.capabilities.contains(CapabilityFlags::READ_WRITE)
    }
}

impl From<Capabilities> for DeviceCapabilities {
    fn from(caps: Capabilities) -> Self {
        Self {
            driver: caps.driver,
            card: caps.card,
            capabilities: caps.capabilities,
        }
    }
}

/// A v4l2loopback device opened for writing.
///
/// Format negotiation goes through the `v4l` control handle; frames are
/// written with `write(2)` on a second descriptor for the same node.
pub struct V4l2Loopback {
    device: Device,
    file: File,
    path: PathBuf,
    format: Option<SinkFormat>,
}

impl fmt::Debug for V4l2Loopback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4l2Loopback")
            .field("path", &self.path)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl V4l2Loopback {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let open_error = |source| SinkError::Open {
            path: path.display().to_string(),
            source,
        };
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(open_error)?;
        let device = Device::with_path(&path).map_err(open_error)?;
        debug!(device = %path.display(), "opened output device");
        Ok(Self {
            device,
            file,
            path,
            format: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Option<&SinkFormat> {
        self.format.as_ref()
    }

    pub fn query_capabilities(&self) -> Result<DeviceCapabilities, SinkError> {
        self.device
            .query_caps()
            .map(DeviceCapabilities::from)
            .map_err(|source| SinkError::Ioctl {
                request: "VIDIOC_QUERYCAP",
                source,
            })
    }

    /// Configure the capture side, for devices that only advertise that.
    pub fn configure_capture_side(&mut self, format: &SinkFormat) -> Result<(), SinkError> {
        let applied =
            Capture::set_format(&self.device, &v4l_format(format)).map_err(s_fmt_error)?;
        log_adjusted(format, &applied);
        self.format = Some(*format);
        Ok(())
    }
}

impl DeviceSink for V4l2Loopback {
    fn configure(&mut self, format: &SinkFormat) -> Result<(), SinkError> {
        let applied =
            Output::set_format(&self.device, &v4l_format(format)).map_err(s_fmt_error)?;
        log_adjusted(format, &applied);
        info!(
            device = %self.path.display(),
            width = format.width,
            height = format.height,
            "output format set"
        );
        self.format = Some(*format);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.file.write(frame)
    }
}

/// Progressive sRGB format with explicit pitch and image size.
fn v4l_format(format: &SinkFormat) -> Format {
    let mut fmt = Format::new(format.width, format.height, format.pixel_format.fourcc());
    fmt.field_order = FieldOrder::Progressive;
    fmt.stride = format.bytes_per_line();
    fmt.size = format.frame_size() as u32;
    fmt.colorspace = Colorspace::SRGB;
    fmt
}

fn log_adjusted(requested: &SinkFormat, applied: &Format) {
    if applied.width != requested.width
        || applied.height != requested.height
        || applied.fourcc != requested.pixel_format.fourcc()
    {
        warn!(
            width = applied.width,
            height = applied.height,
            fourcc = %applied.fourcc,
            "driver adjusted the requested format"
        );
    }
}

fn s_fmt_error(source: io::Error) -> SinkError {
    SinkError::Ioctl {
        request: "VIDIOC_S_FMT",
        source,
    }
}
