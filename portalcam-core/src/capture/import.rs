//! Buffer import: turn a transport buffer into linear pixel bytes.
//!
//! Sources are tried in a fixed order:
//!
//! 1. **GPU import** for dma-bufs, when a [`DmaBufImport`] is installed.
//!    Produces packed RGBA in a reusable readback buffer.
//! 2. **Memory mapping** for mappable dma-bufs and memfds. The mapping is
//!    owned by the returned frame and released when it drops.
//! 3. **Direct access** for memory the transport already mapped.

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, trace};

use crate::capture::buffer::{BufferDescriptor, BufferMemory, Chunk, resolve_stride};
use crate::capture::gpu::{DmaBufFrame, DmaBufImport};
use crate::capture::types::{DRM_FORMAT_XRGB8888, PixelLayout, StreamFormat, required_len};
use crate::error::ImportError;
use crate::flags::DataFlags;

// ── ImportedFrame ────────────────────────────────────────────────

/// Which import path produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSource {
    Gpu,
    Mapped,
    Direct,
}

#[derive(Debug)]
enum Pixels<'a> {
    Borrowed(&'a [u8]),
    Mapped { map: Mmap, start: usize },
}

/// A linear pixel region plus the stride to walk it with.
#[derive(Debug)]
pub struct ImportedFrame<'a> {
    pixels: Pixels<'a>,
    /// Effective row pitch in bytes.
    pub stride: u32,
    /// Set when the import path changed the byte order (GPU readback is
    /// always RGBA).
    pub layout_override: Option<PixelLayout>,
    pub source: ImportSource,
}

impl ImportedFrame<'_> {
    /// The frame bytes, starting at the first pixel.
    pub fn data(&self) -> &[u8] {
        match &self.pixels {
            Pixels::Borrowed(data) => data,
            Pixels::Mapped { map, start } => &map[*start..],
        }
    }
}

// ── BufferImporter ───────────────────────────────────────────────

/// Stateful importer; holds the GPU context and its readback buffer.
#[derive(Default)]
pub struct BufferImporter {
    gpu: Option<Box<dyn DmaBufImport>>,
    readback: Vec<u8>,
}

impl BufferImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a GPU importer for dma-buf frames.
    pub fn with_gpu(mut self, gpu: Box<dyn DmaBufImport>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu.as_ref().is_some_and(|gpu| gpu.supports_dmabuf())
    }

    /// Extract the pixel region of `descriptor` for a frame in `format`.
    pub fn import<'a>(
        &'a mut self,
        descriptor: &BufferDescriptor<'a>,
        format: &StreamFormat,
    ) -> Result<ImportedFrame<'a>, ImportError> {
        let bpp = format.bytes_per_pixel();
        let stride = resolve_stride(&descriptor.chunk, format.width, format.height, bpp);

        match descriptor.memory {
            BufferMemory::DmaBuf {
                fd,
                map_offset,
                max_size,
                flags,
            } => {
                let frame = DmaBufFrame {
                    fd,
                    width: format.width,
                    height: format.height,
                    stride,
                    offset: map_offset,
                    fourcc: format
                        .layout()
                        .map_or(DRM_FORMAT_XRGB8888, PixelLayout::drm_fourcc),
                };
                if self.import_gpu(&frame) {
                    let len = frame.readback_len();
                    return Ok(ImportedFrame {
                        pixels: Pixels::Borrowed(&self.readback[..len]),
                        stride: format.width * 4,
                        layout_override: Some(PixelLayout::Rgba),
                        source: ImportSource::Gpu,
                    });
                }
                if !flags.contains(DataFlags::MAPPABLE) {
                    return Err(ImportError::NotMappable);
                }
                map_region(&fd, map_offset, max_size, &descriptor.chunk, format, stride)
            }
            BufferMemory::MemFd {
                fd,
                map_offset,
                max_size,
                ..
            } => map_region(&fd, map_offset, max_size, &descriptor.chunk, format, stride),
            BufferMemory::MemPtr { data } => {
                let start = descriptor.chunk.offset as usize;
                let region = data.get(start..).unwrap_or_default();
                check_len(region.len(), format, stride, bpp)?;
                Ok(ImportedFrame {
                    pixels: Pixels::Borrowed(region),
                    stride,
                    layout_override: None,
                    source: ImportSource::Direct,
                })
            }
            BufferMemory::Unsupported { kind } => Err(ImportError::UnsupportedMemory(kind)),
        }
    }

    /// Try the GPU path. On success the readback buffer holds the frame.
    fn import_gpu(&mut self, frame: &DmaBufFrame<'_>) -> bool {
        let Some(gpu) = self.gpu.as_mut() else {
            return false;
        };
        if !gpu.supports_dmabuf() {
            return false;
        }

        let len = frame.readback_len();
        if self.readback.len() < len {
            self.readback = Vec::new();
            if self.readback.try_reserve_exact(len).is_err() {
                debug!(len, "cannot allocate gpu readback buffer");
                return false;
            }
            self.readback.resize(len, 0);
        }

        match gpu.import(frame, &mut self.readback[..len]) {
            Ok(()) => true,
            Err(e) => {
                debug!("gpu import failed, falling back to mmap: {e}");
                false
            }
        }
    }
}

fn map_region<'a>(
    fd: &std::os::fd::BorrowedFd<'_>,
    map_offset: u32,
    max_size: u32,
    chunk: &Chunk,
    format: &StreamFormat,
    stride: u32,
) -> Result<ImportedFrame<'a>, ImportError> {
    let len = match max_size {
        0 => chunk.offset as usize + chunk.size as usize,
        n => n as usize,
    };
    let bpp = format.bytes_per_pixel();
    if len == 0 {
        return Err(ImportError::Truncated {
            needed: required_len(stride as usize, format.width as usize * bpp, format.height as usize),
            available: 0,
        });
    }

    // SAFETY: the transport keeps the buffer alive and unmodified until it
    // is requeued, which happens only after this frame is dropped.
    let map = unsafe {
        MmapOptions::new()
            .offset(u64::from(map_offset))
            .len(len)
            .map(fd)
    }?;
    trace!(len, map_offset, "mapped buffer");

    let start = chunk.offset as usize;
    let available = map.len().saturating_sub(start);
    check_len(available, format, stride, bpp)?;

    Ok(ImportedFrame {
        pixels: Pixels::Mapped { map, start },
        stride,
        layout_override: None,
        source: ImportSource::Mapped,
    })
}

fn check_len(
    available: usize,
    format: &StreamFormat,
    stride: u32,
    bpp: usize,
) -> Result<(), ImportError> {
    let needed = required_len(stride as usize, format.width as usize * bpp, format.height as usize);
    if available < needed {
        return Err(ImportError::Truncated { needed, available });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::path::PathBuf;

    use super::*;
    use crate::capture::gpu::GlImportContext;
    use crate::capture::gpu::tests::{FailAt, FakeGl};

    fn temp_file(name: &str, bytes: &[u8]) -> (PathBuf, File) {
        let path = std::env::temp_dir().join(format!(
            "portalcam-import-{}-{name}",
            std::process::id()
        ));
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (path.clone(), File::open(&path).unwrap())
    }

    fn bgrx(width: u32, height: u32) -> StreamFormat {
        StreamFormat::new(PixelLayout::Bgrx.as_raw(), width, height)
    }

    #[test]
    fn direct_memory_honours_chunk_offset() {
        let data: Vec<u8> = (0..40).collect();
        let descriptor = BufferDescriptor {
            memory: BufferMemory::MemPtr { data: &data },
            chunk: Chunk {
                offset: 8,
                size: 32,
                stride: 16,
            },
        };
        let mut importer = BufferImporter::new();
        let frame = importer.import(&descriptor, &bgrx(4, 2)).unwrap();
        assert_eq!(frame.source, ImportSource::Direct);
        assert_eq!(frame.stride, 16);
        assert_eq!(frame.data()[0], 8);
        assert_eq!(frame.layout_override, None);
    }

    #[test]
    fn direct_memory_too_short_is_truncated() {
        let data = [0u8; 20];
        let descriptor = BufferDescriptor {
            memory: BufferMemory::MemPtr { data: &data },
            chunk: Chunk::default(),
        };
        let mut importer = BufferImporter::new();
        let err = importer.import(&descriptor, &bgrx(4, 2)).unwrap_err();
        assert!(matches!(err, ImportError::Truncated { needed: 32, available: 20 }));
    }

    #[test]
    fn memfd_is_mapped() {
        let bytes: Vec<u8> = (0..64).collect();
        let (path, file) = temp_file("memfd", &bytes);
        let descriptor = BufferDescriptor {
            memory: BufferMemory::MemFd {
                fd: file.as_fd(),
                map_offset: 0,
                max_size: 64,
                flags: DataFlags::READABLE,
            },
            chunk: Chunk {
                offset: 32,
                size: 32,
                stride: 0,
            },
        };
        let mut importer = BufferImporter::new();
        let frame = importer.import(&descriptor, &bgrx(4, 2)).unwrap();
        assert_eq!(frame.source, ImportSource::Mapped);
        // stride = size / height
        assert_eq!(frame.stride, 16);
        assert_eq!(frame.data()[0], 32);
        drop(frame);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn unmappable_dmabuf_is_skipped_without_gpu() {
        let (path, file) = temp_file("dmabuf-unmappable", &[0u8; 32]);
        let descriptor = BufferDescriptor {
            memory: BufferMemory::DmaBuf {
                fd: file.as_fd(),
                map_offset: 0,
                max_size: 32,
                flags: DataFlags::READABLE,
            },
            chunk: Chunk::default(),
        };
        let mut importer = BufferImporter::new();
        let err = importer.import(&descriptor, &bgrx(4, 2)).unwrap_err();
        assert!(matches!(err, ImportError::NotMappable));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn mappable_dmabuf_is_mapped() {
        let (path, file) = temp_file("dmabuf-mappable", &[7u8; 32]);
        let descriptor = BufferDescriptor {
            memory: BufferMemory::DmaBuf {
                fd: file.as_fd(),
                map_offset: 0,
                max_size: 32,
                flags: DataFlags::READABLE | DataFlags::MAPPABLE,
            },
            chunk: Chunk::default(),
        };
        let mut importer = BufferImporter::new();
        let frame = importer.import(&descriptor, &bgrx(4, 2)).unwrap();
        assert_eq!(frame.source, ImportSource::Mapped);
        assert!(frame.data().iter().all(|&b| b == 7));
        drop(frame);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn gpu_import_wins_and_reports_rgba() {
        let (path, file) = temp_file("dmabuf-gpu", &[0u8; 32]);
        let descriptor = BufferDescriptor {
            memory: BufferMemory::DmaBuf {
                fd: file.as_fd(),
                map_offset: 0,
                max_size: 32,
                flags: DataFlags::READABLE,
            },
            chunk: Chunk::default(),
        };
        let gpu = GlImportContext::new(FakeGl::new(FailAt::Nothing)).unwrap();
        let mut importer = BufferImporter::new().with_gpu(Box::new(gpu));
        assert!(importer.has_gpu());

        let frame = importer.import(&descriptor, &bgrx(4, 2)).unwrap();
        assert_eq!(frame.source, ImportSource::Gpu);
        assert_eq!(frame.layout_override, Some(PixelLayout::Rgba));
        assert_eq!(frame.stride, 16);
        assert_eq!(&frame.data()[..4], &[255, 0, 0, 255]);
        drop(frame);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn failed_gpu_import_falls_back_to_mmap() {
        let (path, file) = temp_file("dmabuf-gpu-fail", &[9u8; 32]);
        let descriptor = BufferDescriptor {
            memory: BufferMemory::DmaBuf {
                fd: file.as_fd(),
                map_offset: 0,
                max_size: 32,
                flags: DataFlags::MAPPABLE,
            },
            chunk: Chunk::default(),
        };
        let gpu = GlImportContext::new(FakeGl::new(FailAt::Attach)).unwrap();
        let mut importer = BufferImporter::new().with_gpu(Box::new(gpu));
        let frame = importer.import(&descriptor, &bgrx(4, 2)).unwrap();
        assert_eq!(frame.source, ImportSource::Mapped);
        assert_eq!(frame.layout_override, None);
        drop(frame);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn unsupported_memory_is_rejected() {
        let descriptor = BufferDescriptor {
            memory: BufferMemory::Unsupported { kind: 4 },
            chunk: Chunk::default(),
        };
        let mut importer = BufferImporter::new();
        let err = importer.import(&descriptor, &bgrx(4, 2)).unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedMemory(4)));
    }
}
