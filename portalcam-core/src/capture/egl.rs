//! EGL / GLES2 backend for dma-buf import.
//!
//! Loads `libEGL` at runtime, creates a 1×1 pbuffer surface with a GLES2
//! context, and implements [`GlBackend`] on it. [`gpu_importer`] yields an
//! importer only when the display advertises dma-buf image import, so
//! capture carries on with mapped buffers everywhere else.

use std::ffi::c_void;
use std::os::fd::AsRawFd;

use glow::HasContext;
use khronos_egl as egl;
use tracing::{debug, info, warn};

use crate::capture::gpu::{DmaBufFrame, GlBackend, GlImportContext};
use crate::error::GpuError;

const DMA_BUF_IMPORT_EXT: &str = "EGL_EXT_image_dma_buf_import";

const LINUX_DMA_BUF_EXT: egl::Enum = 0x3270;
const LINUX_DRM_FOURCC_EXT: egl::Attrib = 0x3271;
const DMA_BUF_PLANE0_FD_EXT: egl::Attrib = 0x3272;
const DMA_BUF_PLANE0_OFFSET_EXT: egl::Attrib = 0x3273;
const DMA_BUF_PLANE0_PITCH_EXT: egl::Attrib = 0x3274;

/// `glEGLImageTargetTexture2DOES` from `GL_OES_EGL_image`.
type ImageTargetTexture2dOes = unsafe extern "system" fn(target: u32, image: *const c_void);

type Egl = egl::DynamicInstance<egl::EGL1_5>;

/// Build a GPU importer, or `None` when dma-buf import is unavailable.
pub fn gpu_importer() -> Option<GlImportContext<EglBackend>> {
    let backend = match EglBackend::new() {
        Ok(backend) => backend,
        Err(e) => {
            warn!("GPU import unavailable: {e}");
            return None;
        }
    };
    if !backend.has_dmabuf_import() {
        warn!("{DMA_BUF_IMPORT_EXT} not supported; using mapped buffers only");
        return None;
    }
    match GlImportContext::new(backend) {
        Ok(context) => Some(context),
        Err(e) => {
            warn!("GPU import context failed: {e}");
            None
        }
    }
}

// ── EglBackend ───────────────────────────────────────────────────

/// A headless GLES2 context on the default EGL display.
pub struct EglBackend {
    egl: Egl,
    display: egl::Display,
    surface: egl::Surface,
    context: egl::Context,
    gl: glow::Context,
    image_target_texture: ImageTargetTexture2dOes,
    dmabuf_import: bool,
}

// SAFETY: the EGL handles are process-wide values. Every GL call goes
// through `&mut self` and makes the context current on the calling
// thread first, so the backend is only ever used from one thread at a
// time.
unsafe impl Send for EglBackend {}

impl EglBackend {
    pub fn new() -> Result<Self, GpuError> {
        // SAFETY: loading libEGL runs its initialisers; no EGL state
        // exists in this process yet.
        let egl = unsafe { Egl::load_required() }
            .map_err(|e| GpuError::Context(format!("cannot load libEGL: {e:?}")))?;
        // SAFETY: the default display takes no native handle.
        let display = unsafe { egl.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or_else(|| GpuError::Context("no default EGL display".into()))?;
        let (major, minor) = egl.initialize(display).map_err(context_error)?;

        let dmabuf_import = egl
            .query_string(Some(display), egl::EXTENSIONS)
            .is_ok_and(|list| lists_extension(&list.to_string_lossy(), DMA_BUF_IMPORT_EXT));
        info!(major, minor, dmabuf_import, "EGL initialised");

        match create_context(&egl, display) {
            Ok((surface, context, gl, image_target_texture)) => Ok(Self {
                egl,
                display,
                surface,
                context,
                gl,
                image_target_texture,
                dmabuf_import,
            }),
            Err(e) => {
                let _ = egl.terminate(display);
                Err(e)
            }
        }
    }

    fn make_current(&self) -> Result<(), GpuError> {
        self.egl
            .make_current(
                self.display,
                Some(self.surface),
                Some(self.surface),
                Some(self.context),
            )
            .map_err(context_error)
    }

    fn gl_error(&self) -> Option<u32> {
        // SAFETY: only called right after a GL call on the current context.
        match unsafe { self.gl.get_error() } {
            glow::NO_ERROR => None,
            code => Some(code),
        }
    }
}

/// Pbuffer surface, GLES2 context, loaded entry points. Cleans up after
/// itself on failure; the caller terminates the display.
fn create_context(
    egl: &Egl,
    display: egl::Display,
) -> Result<(egl::Surface, egl::Context, glow::Context, ImageTargetTexture2dOes), GpuError> {
    egl.bind_api(egl::OPENGL_ES_API).map_err(context_error)?;

    let config_attribs = [
        egl::SURFACE_TYPE,
        egl::PBUFFER_BIT,
        egl::RED_SIZE,
        8,
        egl::GREEN_SIZE,
        8,
        egl::BLUE_SIZE,
        8,
        egl::ALPHA_SIZE,
        8,
        egl::RENDERABLE_TYPE,
        egl::OPENGL_ES2_BIT,
        egl::NONE,
    ];
    let config = egl
        .choose_first_config(display, &config_attribs)
        .map_err(context_error)?
        .ok_or_else(|| GpuError::Context("no RGBA8 pbuffer config".into()))?;

    let surface = egl
        .create_pbuffer_surface(display, config, &[egl::WIDTH, 1, egl::HEIGHT, 1, egl::NONE])
        .map_err(context_error)?;

    let context = match egl.create_context(
        display,
        config,
        None,
        &[egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE],
    ) {
        Ok(context) => context,
        Err(e) => {
            let _ = egl.destroy_surface(display, surface);
            return Err(context_error(e));
        }
    };

    let teardown = |e: GpuError| {
        let _ = egl.make_current(display, None, None, None);
        let _ = egl.destroy_context(display, context);
        let _ = egl.destroy_surface(display, surface);
        e
    };

    egl.make_current(display, Some(surface), Some(surface), Some(context))
        .map_err(|e| teardown(context_error(e)))?;

    let Some(entry) = egl.get_proc_address("glEGLImageTargetTexture2DOES") else {
        return Err(teardown(GpuError::Context(
            "glEGLImageTargetTexture2DOES not available".into(),
        )));
    };
    // SAFETY: GL_OES_EGL_image defines this entry point with exactly
    // this signature.
    let image_target_texture =
        unsafe { std::mem::transmute::<extern "system" fn(), ImageTargetTexture2dOes>(entry) };

    // SAFETY: the context is current and the loader resolves GLES entry
    // points for it.
    let gl = unsafe {
        glow::Context::from_loader_function(|name| {
            egl.get_proc_address(name)
                .map_or(std::ptr::null(), |f| f as *const c_void)
        })
    };
    // SAFETY: the context is current.
    unsafe {
        debug!(
            vendor = %gl.get_parameter_string(glow::VENDOR),
            renderer = %gl.get_parameter_string(glow::RENDERER),
            version = %gl.get_parameter_string(glow::VERSION),
            "GLES context ready"
        );
    }

    Ok((surface, context, gl, image_target_texture))
}

impl GlBackend for EglBackend {
    type Image = egl::Image;
    type Texture = glow::NativeTexture;
    type Framebuffer = glow::NativeFramebuffer;

    fn has_dmabuf_import(&self) -> bool {
        self.dmabuf_import
    }

    fn create_framebuffer(&mut self) -> Result<glow::NativeFramebuffer, GpuError> {
        self.make_current()?;
        // SAFETY: the context is current.
        unsafe { self.gl.create_framebuffer() }.map_err(GpuError::Context)
    }

    fn create_image(&mut self, frame: &DmaBufFrame<'_>) -> Result<egl::Image, GpuError> {
        self.make_current()?;
        let attribs = [
            egl::WIDTH as egl::Attrib,
            frame.width as egl::Attrib,
            egl::HEIGHT as egl::Attrib,
            frame.height as egl::Attrib,
            LINUX_DRM_FOURCC_EXT,
            frame.fourcc as egl::Attrib,
            DMA_BUF_PLANE0_FD_EXT,
            frame.fd.as_raw_fd() as egl::Attrib,
            DMA_BUF_PLANE0_OFFSET_EXT,
            frame.offset as egl::Attrib,
            DMA_BUF_PLANE0_PITCH_EXT,
            frame.stride as egl::Attrib,
            egl::NONE as egl::Attrib,
        ];
        // SAFETY: dma-buf images take no client buffer or context; the
        // attribute list is NONE-terminated and the fd outlives the call.
        let (no_context, no_buffer) = unsafe {
            (
                egl::Context::from_ptr(egl::NO_CONTEXT),
                egl::ClientBuffer::from_ptr(std::ptr::null_mut()),
            )
        };
        self.egl
            .create_image(self.display, no_context, LINUX_DMA_BUF_EXT, no_buffer, &attribs)
            .map_err(|e| GpuError::CreateImage(e.to_string()))
    }

    fn create_texture(&mut self, image: &egl::Image) -> Result<glow::NativeTexture, GpuError> {
        // SAFETY: the context was made current by `create_image`, and
        // `image` is a live EGL image on this display.
        unsafe {
            let texture = self.gl.create_texture().map_err(GpuError::BindTexture)?;
            self.gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            for (name, value) in [
                (glow::TEXTURE_MIN_FILTER, glow::NEAREST),
                (glow::TEXTURE_MAG_FILTER, glow::NEAREST),
                (glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE),
                (glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE),
            ] {
                self.gl.tex_parameter_i32(glow::TEXTURE_2D, name, value as i32);
            }
            (self.image_target_texture)(glow::TEXTURE_2D, image.as_ptr());
            if let Some(code) = self.gl_error() {
                self.gl.bind_texture(glow::TEXTURE_2D, None);
                self.gl.delete_texture(texture);
                return Err(GpuError::BindTexture(format!("GL error {code:#x}")));
            }
            Ok(texture)
        }
    }

    fn attach(
        &mut self,
        framebuffer: &glow::NativeFramebuffer,
        texture: &glow::NativeTexture,
    ) -> Result<(), GpuError> {
        // SAFETY: the context is current; both objects belong to it.
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(*framebuffer));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(*texture),
                0,
            );
            let status = self.gl.check_framebuffer_status(glow::FRAMEBUFFER);
            if status != glow::FRAMEBUFFER_COMPLETE {
                self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
                return Err(GpuError::IncompleteFramebuffer(status));
            }
        }
        Ok(())
    }

    fn read_pixels(&mut self, width: u32, height: u32, out: &mut [u8]) -> Result<(), GpuError> {
        let len = width as usize * height as usize * 4;
        let out = out.get_mut(..len).ok_or(GpuError::ReadbackTooSmall {
            needed: len,
            available: out.len(),
        })?;
        // SAFETY: the context is current and `out` holds exactly
        // `width * height` RGBA pixels with byte packing.
        unsafe {
            self.gl.viewport(0, 0, width as i32, height as i32);
            self.gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            self.gl.read_pixels(
                0,
                0,
                width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(out),
            );
        }
        match self.gl_error() {
            None => Ok(()),
            Some(code) => Err(GpuError::ReadPixels(format!("GL error {code:#x}"))),
        }
    }

    fn detach(&mut self, _framebuffer: &glow::NativeFramebuffer) {
        // SAFETY: the context is current.
        unsafe { self.gl.bind_framebuffer(glow::FRAMEBUFFER, None) };
    }

    fn destroy_texture(&mut self, texture: glow::NativeTexture) {
        // SAFETY: the context is current and `texture` is no longer bound
        // to the framebuffer.
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, None);
            self.gl.delete_texture(texture);
        }
    }

    fn destroy_image(&mut self, image: egl::Image) {
        if let Err(e) = self.egl.destroy_image(self.display, image) {
            warn!("eglDestroyImage failed: {e}");
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: glow::NativeFramebuffer) {
        if self.make_current().is_ok() {
            // SAFETY: the context is current.
            unsafe { self.gl.delete_framebuffer(framebuffer) };
        }
    }
}

impl Drop for EglBackend {
    fn drop(&mut self) {
        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.destroy_surface(self.display, self.surface);
        let _ = self.egl.terminate(self.display);
    }
}

fn lists_extension(extensions: &str, name: &str) -> bool {
    extensions.split_ascii_whitespace().any(|ext| ext == name)
}

fn context_error(e: egl::Error) -> GpuError {
    GpuError::Context(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_match_is_whole_word() {
        let list = "EGL_KHR_image_base EGL_EXT_image_dma_buf_import_modifiers";
        assert!(!lists_extension(list, DMA_BUF_IMPORT_EXT));
        let list = "EGL_KHR_image_base EGL_EXT_image_dma_buf_import EGL_KHR_fence_sync";
        assert!(lists_extension(list, DMA_BUF_IMPORT_EXT));
        assert!(!lists_extension("", DMA_BUF_IMPORT_EXT));
    }

}
