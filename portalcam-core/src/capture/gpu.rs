//! GPU import of dma-buf frames.
//!
//! The GPU path wraps a dma-buf in an image, binds it to a texture,
//! attaches that texture to one persistent framebuffer, and reads the
//! pixels back as packed RGBA. The per-call image and texture are
//! destroyed on every path, success or failure.
//!
//! The graphics API sits behind [`GlBackend`]; [`GlImportContext`] owns
//! the step ordering and the cleanup guarantees.

use std::os::fd::BorrowedFd;

use tracing::debug;

use crate::error::GpuError;

// ── DmaBufFrame ──────────────────────────────────────────────────

/// Everything needed to import one dma-buf plane.
#[derive(Debug, Clone, Copy)]
pub struct DmaBufFrame<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: u32,
    pub height: u32,
    /// Row pitch of the dma-buf plane.
    pub stride: u32,
    /// Byte offset of the plane inside the dma-buf.
    pub offset: u32,
    /// DRM fourcc of the plane.
    pub fourcc: u32,
}

impl DmaBufFrame<'_> {
    /// Bytes produced by a packed RGBA readback of this frame.
    pub fn readback_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// A GPU importer as seen by the buffer importer.
pub trait DmaBufImport: Send {
    /// Whether the context can import dma-bufs at all.
    fn supports_dmabuf(&self) -> bool;

    /// Import `frame` and write packed RGBA into `out`.
    fn import(&mut self, frame: &DmaBufFrame<'_>, out: &mut [u8]) -> Result<(), GpuError>;
}

// ── GlBackend ────────────────────────────────────────────────────

/// Graphics operations the import sequence is built from.
pub trait GlBackend: Send {
    type Image;
    type Texture;
    type Framebuffer: Send;

    /// Whether the image-from-dma-buf extension is present.
    fn has_dmabuf_import(&self) -> bool;

    fn create_framebuffer(&mut self) -> Result<Self::Framebuffer, GpuError>;

    fn create_image(&mut self, frame: &DmaBufFrame<'_>) -> Result<Self::Image, GpuError>;

    /// Create a texture and bind `image` as its storage.
    fn create_texture(&mut self, image: &Self::Image) -> Result<Self::Texture, GpuError>;

    /// Attach `texture` as the framebuffer's color target and check
    /// completeness.
    fn attach(
        &mut self,
        framebuffer: &Self::Framebuffer,
        texture: &Self::Texture,
    ) -> Result<(), GpuError>;

    /// Read `width * height` RGBA pixels from the bound framebuffer.
    fn read_pixels(&mut self, width: u32, height: u32, out: &mut [u8]) -> Result<(), GpuError>;

    fn detach(&mut self, framebuffer: &Self::Framebuffer);

    fn destroy_texture(&mut self, texture: Self::Texture);

    fn destroy_image(&mut self, image: Self::Image);

    fn destroy_framebuffer(&mut self, framebuffer: Self::Framebuffer);
}

// ── GlImportContext ──────────────────────────────────────────────

/// A graphics context with one persistent framebuffer for readback.
pub struct GlImportContext<B: GlBackend> {
    backend: B,
    framebuffer: Option<B::Framebuffer>,
    dmabuf_import: bool,
}

impl<B: GlBackend> GlImportContext<B> {
    /// Create the persistent framebuffer and probe import support.
    pub fn new(mut backend: B) -> Result<Self, GpuError> {
        let dmabuf_import = backend.has_dmabuf_import();
        let framebuffer = backend.create_framebuffer()?;
        debug!(dmabuf_import, "gpu import context ready");
        Ok(Self {
            backend,
            framebuffer: Some(framebuffer),
            dmabuf_import,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Steps that run once the image exists. The texture is destroyed
    /// before returning.
    fn import_image(
        &mut self,
        image: &B::Image,
        frame: &DmaBufFrame<'_>,
        out: &mut [u8],
    ) -> Result<(), GpuError> {
        let framebuffer = self.framebuffer.as_ref().ok_or(GpuError::Unsupported)?;
        let texture = self.backend.create_texture(image)?;

        let result = match self.backend.attach(framebuffer, &texture) {
            Ok(()) => {
                let read = if out.len() < frame.readback_len() {
                    Err(GpuError::ReadbackTooSmall {
                        needed: frame.readback_len(),
                        available: out.len(),
                    })
                } else {
                    self.backend.read_pixels(frame.width, frame.height, out)
                };
                self.backend.detach(framebuffer);
                read
            }
            Err(e) => Err(e),
        };

        self.backend.destroy_texture(texture);
        result
    }
}

impl<B: GlBackend> DmaBufImport for GlImportContext<B> {
    fn supports_dmabuf(&self) -> bool {
        self.dmabuf_import
    }

    fn import(&mut self, frame: &DmaBufFrame<'_>, out: &mut [u8]) -> Result<(), GpuError> {
        if !self.dmabuf_import {
            return Err(GpuError::Unsupported);
        }
        let image = self.backend.create_image(frame)?;
        let result = self.import_image(&image, frame, out);
        self.backend.destroy_image(image);
        result
    }
}

impl<B: GlBackend> Drop for GlImportContext<B> {
    fn drop(&mut self) {
        if let Some(framebuffer) = self.framebuffer.take() {
            self.backend.destroy_framebuffer(framebuffer);
        }
    }
}
