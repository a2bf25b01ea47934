//! # capture: stream buffers to loopback frames
//!
//! ## Architecture
//!
//! ```text
//!  stream transport                                        loopback device
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!  │ StreamBuffer │──►│BufferImporter│──►│FormatConverter──►│  DeviceSink  │
//!  └──────────────┘   │ gpu/mmap/ptr │   │  RGB → YUYV  │   └──────────────┘
//!                     └──────────────┘   └──────────────┘
//!                            ▲  FramePipeline: warm-up, validation, bookkeeping
//! ```
//!
//! ## Sub-modules
//!
//! | Module     | Purpose                                              |
//! |------------|------------------------------------------------------|
//! | `types`    | Pixel layouts, negotiated format, frame views        |
//! | `buffer`   | Transport buffer descriptors and stride resolution   |
//! | `gpu`      | dma-buf import through a GL read-back context        |
//! | `egl`      | EGL/GLES2 backend for `gpu` (feature `desktop`)      |
//! | `import`   | Buffer memory to CPU-readable pixels                 |
//! | `convert`  | Ten RGB layouts to packed YUYV                       |
//! | `validate` | Warm-up gate, content check, write-failure tracking  |
//! | `sink`     | V4L2 loopback output device                          |
//! | `pattern`  | Colour-bar test frames                               |
//! | `pipeline` | Per-frame sequencing driven by stream events         |
//! | `pipewire` | PipeWire stream adapter (feature `desktop`)          |

pub mod buffer;
pub mod convert;
pub mod gpu;
pub mod import;
pub mod pattern;
pub mod pipeline;
pub mod sink;
pub mod types;
pub mod validate;

#[cfg(feature = "desktop")]
pub mod egl;
#[cfg(feature = "desktop")]
pub mod pipewire;

// ── Re-exports ───────────────────────────────────────────────────

pub use buffer::{BufferDescriptor, BufferMemory, Chunk, StreamBuffer};
pub use convert::{ConversionBuffer, FormatConverter};
pub use gpu::{DmaBufFrame, DmaBufImport, GlBackend, GlImportContext};
pub use import::{BufferImporter, ImportSource, ImportedFrame};
pub use pipeline::{FrameOutcome, FramePipeline, PipelineConfig, PipelineStats, StreamState};
pub use sink::{DeviceSink, OutputPixelFormat, SinkFormat, V4l2Loopback};
pub use types::{FrameView, PixelLayout, StreamFormat};
