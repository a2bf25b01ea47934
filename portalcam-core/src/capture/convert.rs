//! Pixel conversion to packed YUYV 4:2:2.
//!
//! ## Routes
//!
//! Every supported [`PixelLayout`] maps to exactly one converter in
//! [`conversion_for`]:
//!
//! - **Generic** (eight layouts): reorder into a B,G,R,A intermediate,
//!   then pack with integer BT.601 limited-range coefficients.
//! - **Direct** (`BGRx`, `BGRA`): one pass with the full-range transform
//!   `Y = (77R + 150G + 29B) >> 8`.
//!
//! Both routes take tightly packed input. [`FormatConverter`] repacks
//! padded rows into a temporary buffer first.
//!
//! ## Output
//!
//! Each pair of pixels becomes `Y0 U Y1 V`; chroma comes from the pair's
//! mean colour. For odd widths the last pixel pairs with itself and the
//! trailing `V` is dropped so rows stay `width * 2` bytes.

use crate::capture::types::{FrameView, PixelLayout};
use crate::error::ConvertError;

/// Output bytes per pixel.
pub const YUYV_BYTES_PER_PIXEL: usize = 2;

/// A tightly packed source frame.
#[derive(Debug, Clone, Copy)]
pub struct TightFrame<'a> {
    pub data: &'a [u8],
    pub width: usize,
    pub height: usize,
}

/// Converts a tight frame into `out`, using `scratch` for intermediates.
pub type ConvertFn = fn(&TightFrame<'_>, &mut Vec<u8>, &mut [u8]) -> Result<(), ConvertError>;

/// Look up the converter for `layout`.
pub fn conversion_for(layout: PixelLayout) -> ConvertFn {
    match layout {
        PixelLayout::Rgbx => rgbx_to_yuyv,
        PixelLayout::Bgrx | PixelLayout::Bgra => bgrx_to_yuyv_direct,
        PixelLayout::Xrgb => xrgb_to_yuyv,
        PixelLayout::Xbgr => xbgr_to_yuyv,
        PixelLayout::Rgba => rgba_to_yuyv,
        PixelLayout::Argb => argb_to_yuyv,
        PixelLayout::Abgr => abgr_to_yuyv,
        PixelLayout::Rgb => rgb_to_yuyv,
        PixelLayout::Bgr => bgr_to_yuyv,
    }
}

/// Resolve a raw stream format id to a convertible layout.
pub fn layout_for(format_id: u32) -> Result<PixelLayout, ConvertError> {
    PixelLayout::try_from(format_id).map_err(ConvertError::UnsupportedLayout)
}

// ── Table entries ────────────────────────────────────────────────

fn rgbx_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Rgbx, scratch, out)
}

fn xrgb_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Xrgb, scratch, out)
}

fn xbgr_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Xbgr, scratch, out)
}

fn rgba_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Rgba, scratch, out)
}

fn argb_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Argb, scratch, out)
}

fn abgr_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Abgr, scratch, out)
}

fn rgb_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Rgb, scratch, out)
}

fn bgr_to_yuyv(src: &TightFrame<'_>, scratch: &mut Vec<u8>, out: &mut [u8]) -> Result<(), ConvertError> {
    via_intermediate(src, PixelLayout::Bgr, scratch, out)
}

/// Single-pass full-range conversion for B,G,R,x memory order.
fn bgrx_to_yuyv_direct(
    src: &TightFrame<'_>,
    _scratch: &mut Vec<u8>,
    out: &mut [u8],
) -> Result<(), ConvertError> {
    pack_pairs(src.data, 4, src.width, src.height, out, |px| (px[2], px[1], px[0]), full_range);
    Ok(())
}

// ── Generic route ────────────────────────────────────────────────

fn via_intermediate(
    src: &TightFrame<'_>,
    layout: PixelLayout,
    scratch: &mut Vec<u8>,
    out: &mut [u8],
) -> Result<(), ConvertError> {
    to_bgra(src, layout, scratch)?;
    pack_pairs(&scratch[..], 4, src.width, src.height, out, |px| (px[2], px[1], px[0]), limited_range);
    Ok(())
}

/// Reorder `src` into B,G,R,A memory order. Layouts without alpha get
/// 0xFF.
fn to_bgra(src: &TightFrame<'_>, layout: PixelLayout, scratch: &mut Vec<u8>) -> Result<(), ConvertError> {
    let len = src.width * src.height * 4;
    scratch.clear();
    scratch
        .try_reserve_exact(len)
        .map_err(|_| ConvertError::Allocation { bytes: len })?;
    scratch.resize(len, 0);

    let [r, g, b] = layout.rgb_offsets();
    let alpha = layout.alpha_offset();
    let pixels = src.data.chunks_exact(layout.bytes_per_pixel());
    for (px, dst) in pixels.zip(scratch.chunks_exact_mut(4)) {
        dst[0] = px[b];
        dst[1] = px[g];
        dst[2] = px[r];
        dst[3] = alpha.map_or(0xFF, |a| px[a]);
    }
    Ok(())
}

// ── Packing ──────────────────────────────────────────────────────

/// Y, U, V from an averaged pair colour plus each pixel's own luma.
type Transform = fn(Rgb, Rgb) -> (u8, u8, u8, u8);

#[derive(Debug, Clone, Copy)]
struct Rgb {
    r: i32,
    g: i32,
    b: i32,
}

fn pack_pairs(
    src: &[u8],
    bpp: usize,
    width: usize,
    height: usize,
    out: &mut [u8],
    channels: impl Fn(&[u8]) -> (u8, u8, u8),
    transform: Transform,
) {
    if width == 0 || height == 0 {
        return;
    }
    let src_row_len = width * bpp;
    let dst_row_len = width * 2;
    let rgb = |px: &[u8]| {
        let (r, g, b) = channels(px);
        Rgb {
            r: i32::from(r),
            g: i32::from(g),
            b: i32::from(b),
        }
    };

    for (src_row, dst_row) in src
        .chunks_exact(src_row_len)
        .zip(out.chunks_exact_mut(dst_row_len))
        .take(height)
    {
        for x in (0..width).step_by(2) {
            let p0 = rgb(&src_row[x * bpp..]);
            let p1 = if x + 1 < width {
                rgb(&src_row[(x + 1) * bpp..])
            } else {
                p0
            };
            let (y0, u, y1, v) = transform(p0, p1);
            let o = x * 2;
            dst_row[o] = y0;
            dst_row[o + 1] = u;
            if o + 3 < dst_row_len {
                dst_row[o + 2] = y1;
                dst_row[o + 3] = v;
            }
        }
    }
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 limited range, rounded pair mean for chroma.
fn limited_range(p0: Rgb, p1: Rgb) -> (u8, u8, u8, u8) {
    let luma = |p: Rgb| clamp(((66 * p.r + 129 * p.g + 25 * p.b + 128) >> 8) + 16);
    let r = (p0.r + p1.r + 1) >> 1;
    let g = (p0.g + p1.g + 1) >> 1;
    let b = (p0.b + p1.b + 1) >> 1;
    let u = clamp(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
    let v = clamp(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
    (luma(p0), u, luma(p1), v)
}

/// Full-range transform, truncating pair mean for chroma.
fn full_range(p0: Rgb, p1: Rgb) -> (u8, u8, u8, u8) {
    let luma = |p: Rgb| clamp((77 * p.r + 150 * p.g + 29 * p.b) >> 8);
    let r = (p0.r + p1.r) / 2;
    let g = (p0.g + p1.g) / 2;
    let b = (p0.b + p1.b) / 2;
    let u = clamp(((-38 * r - 74 * g + 112 * b) >> 8) + 128);
    let v = clamp(((112 * r - 94 * g - 18 * b) >> 8) + 128);
    (luma(p0), u, luma(p1), v)
}

// ── FormatConverter ──────────────────────────────────────────────

/// Stateful converter; keeps the intermediate buffer between frames.
#[derive(Debug, Default)]
pub struct FormatConverter {
    scratch: Vec<u8>,
}

impl FormatConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert `frame` into `out`, which must hold exactly one YUYV frame.
    pub fn convert(&mut self, frame: &FrameView<'_>, out: &mut [u8]) -> Result<(), ConvertError> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let expected = width * height * YUYV_BYTES_PER_PIXEL;
        if out.len() != expected {
            return Err(ConvertError::OutputSize {
                expected,
                actual: out.len(),
            });
        }

        let tight = frame.tight_stride();
        if (frame.stride as usize) < tight {
            return Err(ConvertError::StrideTooSmall {
                stride: frame.stride,
                tight,
            });
        }

        let needed = frame.required_len();
        if frame.data.len() < needed {
            return Err(ConvertError::SourceTooSmall {
                needed,
                actual: frame.data.len(),
            });
        }

        let convert = conversion_for(frame.layout);
        if frame.stride as usize > tight {
            let packed = repack_rows(frame)?;
            let src = TightFrame {
                data: &packed,
                width,
                height,
            };
            convert(&src, &mut self.scratch, out)
        } else {
            let src = TightFrame {
                data: &frame.data[..tight * height],
                width,
                height,
            };
            convert(&src, &mut self.scratch, out)
        }
    }
}

/// Copy each row's pixel bytes into a new tight buffer.
fn repack_rows(frame: &FrameView<'_>) -> Result<Vec<u8>, ConvertError> {
    let len = frame.tight_stride() * frame.height as usize;
    let mut packed = Vec::new();
    packed
        .try_reserve_exact(len)
        .map_err(|_| ConvertError::Allocation { bytes: len })?;
    for y in 0..frame.height {
        packed.extend_from_slice(frame.row(y));
    }
    Ok(packed)
}

// ── ConversionBuffer ─────────────────────────────────────────────

/// Output frame storage sized for the current dimensions.
#[derive(Debug, Default)]
pub struct ConversionBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl ConversionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reallocate for `width x height`. The old storage is released first.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), ConvertError> {
        let len = width as usize * height as usize * YUYV_BYTES_PER_PIXEL;
        self.data = Vec::new();
        self.width = 0;
        self.height = 0;
        self.data
            .try_reserve_exact(len)
            .map_err(|_| ConvertError::Allocation { bytes: len })?;
        self.data.resize(len, 0);
        self.width = width;
        self.height = height;
        Ok(())
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height && !self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILLER: u8 = 0xAA;

    /// One pixel of (r, g, b) in `layout`, with filler in unused bytes.
    fn pixel(layout: PixelLayout, r: u8, g: u8, b: u8) -> Vec<u8> {
        let mut px = vec![FILLER; layout.bytes_per_pixel()];
        let [ro, go, bo] = layout.rgb_offsets();
        px[ro] = r;
        px[go] = g;
        px[bo] = b;
        if let Some(a) = layout.alpha_offset() {
            px[a] = 0xFF;
        }
        px
    }

    fn uniform(layout: PixelLayout, width: u32, height: u32, rgb: (u8, u8, u8)) -> Vec<u8> {
        let px = pixel(layout, rgb.0, rgb.1, rgb.2);
        px.iter()
            .copied()
            .cycle()
            .take(px.len() * (width * height) as usize)
            .collect()
    }

    fn convert(layout: PixelLayout, data: &[u8], width: u32, height: u32, stride: u32) -> Vec<u8> {
        let frame = FrameView {
            data,
            width,
            height,
            stride,
            layout,
        };
        let mut out = vec![0u8; (width * height * 2) as usize];
        FormatConverter::new().convert(&frame, &mut out).unwrap();
        out
    }

    fn assert_macropixels(out: &[u8], expected: [u8; 4]) {
        for (i, mp) in out.chunks_exact(4).enumerate() {
            for (got, want) in mp.iter().zip(expected) {
                assert!(
                    (i32::from(*got) - i32::from(want)).abs() <= 1,
                    "macropixel {i}: got {mp:?}, want {expected:?}"
                );
            }
        }
    }

    // (200, 100, 50) through each route.
    const LIMITED: [u8; 4] = [123, 91, 123, 175];
    const FULL: [u8; 4] = [124, 91, 124, 175];

    fn check_layout(layout: PixelLayout, expected: [u8; 4]) {
        let data = uniform(layout, 4, 2, (200, 100, 50));
        let out = convert(layout, &data, 4, 2, 4 * layout.bytes_per_pixel() as u32);
        assert_macropixels(&out, expected);
    }

    #[test]
    fn rgbx_uniform() {
        check_layout(PixelLayout::Rgbx, LIMITED);
    }

    #[test]
    fn bgrx_uniform_direct() {
        check_layout(PixelLayout::Bgrx, FULL);
    }

    #[test]
    fn xrgb_uniform() {
        check_layout(PixelLayout::Xrgb, LIMITED);
    }

    #[test]
    fn xbgr_uniform() {
        check_layout(PixelLayout::Xbgr, LIMITED);
    }

    #[test]
    fn rgba_uniform() {
        check_layout(PixelLayout::Rgba, LIMITED);
    }

    #[test]
    fn bgra_uniform_direct() {
        check_layout(PixelLayout::Bgra, FULL);
    }

    #[test]
    fn argb_uniform() {
        check_layout(PixelLayout::Argb, LIMITED);
    }

    #[test]
    fn abgr_uniform() {
        check_layout(PixelLayout::Abgr, LIMITED);
    }

    #[test]
    fn rgb_uniform() {
        check_layout(PixelLayout::Rgb, LIMITED);
    }

    #[test]
    fn bgr_uniform() {
        check_layout(PixelLayout::Bgr, LIMITED);
    }

    #[test]
    fn bgr_alpha_variants_share_direct_route() {
        assert_eq!(
            conversion_for(PixelLayout::Bgrx) as usize,
            conversion_for(PixelLayout::Bgra) as usize
        );
        assert_ne!(
            conversion_for(PixelLayout::Rgbx) as usize,
            conversion_for(PixelLayout::Bgrx) as usize
        );
    }

    #[test]
    fn pure_red_xrgb() {
        let data = uniform(PixelLayout::Xrgb, 2, 1, (255, 0, 0));
        let out = convert(PixelLayout::Xrgb, &data, 2, 1, 8);
        assert_eq!(out, vec![82, 90, 82, 240]);
    }

    #[test]
    fn direct_route_white_and_black() {
        let white = uniform(PixelLayout::Bgrx, 2, 1, (255, 255, 255));
        assert_eq!(convert(PixelLayout::Bgrx, &white, 2, 1, 8), vec![255, 128, 255, 128]);
        let black = uniform(PixelLayout::Bgrx, 2, 1, (0, 0, 0));
        assert_eq!(convert(PixelLayout::Bgrx, &black, 2, 1, 8), vec![0, 128, 0, 128]);
    }

    #[test]
    fn padded_rows_match_tight_rows() {
        let (width, height) = (6u32, 3u32);
        let layout = PixelLayout::Rgb;
        let tight_stride = width * 3;
        let padded_stride = tight_stride + 14;

        // A gradient so rows differ.
        let mut tight = Vec::new();
        let mut padded = Vec::new();
        for y in 0..height {
            let mut row = Vec::new();
            for x in 0..width {
                row.extend(pixel(layout, (x * 40) as u8, (y * 80) as u8, 30));
            }
            tight.extend_from_slice(&row);
            padded.extend_from_slice(&row);
            padded.extend(std::iter::repeat_n(0xEE, (padded_stride - tight_stride) as usize));
        }

        let a = convert(layout, &tight, width, height, tight_stride);
        let b = convert(layout, &padded, width, height, padded_stride);
        assert_eq!(a, b);
    }

    #[test]
    fn odd_width_truncates_last_macropixel() {
        let data = uniform(PixelLayout::Rgbx, 3, 1, (200, 100, 50));
        let out = convert(PixelLayout::Rgbx, &data, 3, 1, 12);
        assert_eq!(out.len(), 6);
        assert_eq!(&out[..4], &LIMITED);
        assert_eq!(&out[4..], &LIMITED[..2]);
    }

    #[test]
    fn unknown_format_id_is_rejected() {
        assert!(matches!(layout_for(2), Err(ConvertError::UnsupportedLayout(2))));
        assert_eq!(layout_for(9).unwrap(), PixelLayout::Xrgb);
    }

    #[test]
    fn wrong_output_size_is_rejected() {
        let data = uniform(PixelLayout::Rgbx, 2, 2, (0, 0, 0));
        let frame = FrameView {
            data: &data,
            width: 2,
            height: 2,
            stride: 8,
            layout: PixelLayout::Rgbx,
        };
        let mut out = vec![0u8; 7];
        let err = FormatConverter::new().convert(&frame, &mut out).unwrap_err();
        assert!(matches!(err, ConvertError::OutputSize { expected: 8, actual: 7 }));
    }

    #[test]
    fn short_source_is_rejected() {
        let data = vec![0u8; 10];
        let frame = FrameView {
            data: &data,
            width: 2,
            height: 2,
            stride: 8,
            layout: PixelLayout::Rgbx,
        };
        let mut out = vec![0u8; 8];
        let err = FormatConverter::new().convert(&frame, &mut out).unwrap_err();
        assert!(matches!(err, ConvertError::SourceTooSmall { needed: 16, actual: 10 }));
    }

    #[test]
    fn stride_below_row_width_is_rejected() {
        let data = vec![9u8; 12];
        let frame = FrameView {
            data: &data,
            width: 2,
            height: 2,
            stride: 4,
            layout: PixelLayout::Rgbx,
        };
        let mut out = vec![0u8; 8];
        let err = FormatConverter::new().convert(&frame, &mut out).unwrap_err();
        assert!(matches!(err, ConvertError::StrideTooSmall { stride: 4, tight: 8 }));
    }

    #[test]
    fn conversion_buffer_tracks_dimensions() {
        let mut buffer = ConversionBuffer::new();
        assert!(!buffer.matches(4, 2));
        buffer.resize(4, 2).unwrap();
        assert_eq!(buffer.len(), 16);
        assert!(buffer.matches(4, 2));
        buffer.resize(8, 2).unwrap();
        assert_eq!(buffer.len(), 32);
        assert!(!buffer.matches(4, 2));
    }
}
