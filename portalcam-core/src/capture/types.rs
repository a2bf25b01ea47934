//! Shared types for the capture pipeline stages.

// ── PixelLayout ──────────────────────────────────────────────────

/// Input pixel layouts the converter accepts.
///
/// Discriminants are the SPA video format ids the stream negotiates.
/// Names give the byte order in memory, lowest address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelLayout {
    Rgbx = 7,
    Bgrx = 8,
    Xrgb = 9,
    Xbgr = 10,
    Rgba = 11,
    Bgra = 12,
    Argb = 13,
    Abgr = 14,
    Rgb = 15,
    Bgr = 16,
}

impl PixelLayout {
    pub const ALL: [PixelLayout; 10] = [
        PixelLayout::Rgbx,
        PixelLayout::Bgrx,
        PixelLayout::Xrgb,
        PixelLayout::Xbgr,
        PixelLayout::Rgba,
        PixelLayout::Bgra,
        PixelLayout::Argb,
        PixelLayout::Abgr,
        PixelLayout::Rgb,
        PixelLayout::Bgr,
    ];

    /// Bytes consumed by a single pixel in this layout.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Rgb | PixelLayout::Bgr => 3,
            _ => 4,
        }
    }

    /// Byte offsets of the red, green and blue channels within a pixel.
    pub const fn rgb_offsets(self) -> [usize; 3] {
        match self {
            PixelLayout::Rgbx | PixelLayout::Rgba | PixelLayout::Rgb => [0, 1, 2],
            PixelLayout::Bgrx | PixelLayout::Bgra | PixelLayout::Bgr => [2, 1, 0],
            PixelLayout::Xrgb | PixelLayout::Argb => [1, 2, 3],
            PixelLayout::Xbgr | PixelLayout::Abgr => [3, 2, 1],
        }
    }

    /// Byte offset of a real alpha channel, if the layout has one.
    pub const fn alpha_offset(self) -> Option<usize> {
        match self {
            PixelLayout::Rgba | PixelLayout::Bgra => Some(3),
            PixelLayout::Argb | PixelLayout::Abgr => Some(0),
            _ => None,
        }
    }

    /// The DRM fourcc describing the same memory layout.
    ///
    /// DRM names are little-endian words, so SPA `BGRx` is `XR24`.
    pub const fn drm_fourcc(self) -> u32 {
        match self {
            PixelLayout::Bgrx => fourcc(b"XR24"),
            PixelLayout::Rgbx => fourcc(b"XB24"),
            PixelLayout::Xrgb => fourcc(b"BX24"),
            PixelLayout::Xbgr => fourcc(b"RX24"),
            PixelLayout::Bgra => fourcc(b"AR24"),
            PixelLayout::Rgba => fourcc(b"AB24"),
            PixelLayout::Argb => fourcc(b"BA24"),
            PixelLayout::Abgr => fourcc(b"RA24"),
            PixelLayout::Rgb => fourcc(b"BG24"),
            PixelLayout::Bgr => fourcc(b"RG24"),
        }
    }

    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PixelLayout {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        PixelLayout::ALL
            .into_iter()
            .find(|layout| layout.as_raw() == value)
            .ok_or(value)
    }
}

impl std::fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PixelLayout::Rgbx => "RGBx",
            PixelLayout::Bgrx => "BGRx",
            PixelLayout::Xrgb => "xRGB",
            PixelLayout::Xbgr => "xBGR",
            PixelLayout::Rgba => "RGBA",
            PixelLayout::Bgra => "BGRA",
            PixelLayout::Argb => "ARGB",
            PixelLayout::Abgr => "ABGR",
            PixelLayout::Rgb => "RGB",
            PixelLayout::Bgr => "BGR",
        };
        f.write_str(name)
    }
}

/// Packs four ASCII bytes into a little-endian fourcc code.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// DRM fourcc used when the stream format is not a known layout.
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b"XR24");

// ── StreamFormat ─────────────────────────────────────────────────

/// The negotiated video format of the live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Raw SPA format id; may name a layout we cannot convert.
    pub format_id: u32,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes. Starts as `width * bpp` and is corrected from
    /// buffer metadata.
    pub stride: u32,
}

impl StreamFormat {
    pub fn new(format_id: u32, width: u32, height: u32) -> Self {
        let mut format = Self {
            format_id,
            width,
            height,
            stride: 0,
        };
        format.stride = format.min_stride();
        format
    }

    pub fn layout(&self) -> Option<PixelLayout> {
        PixelLayout::try_from(self.format_id).ok()
    }

    /// Bytes per pixel, assuming 4 for unknown layouts.
    pub fn bytes_per_pixel(&self) -> usize {
        self.layout().map_or(4, PixelLayout::bytes_per_pixel)
    }

    /// Tightly packed row length in bytes.
    pub fn min_stride(&self) -> u32 {
        self.width * self.bytes_per_pixel() as u32
    }

    pub fn same_dimensions(&self, other: &StreamFormat) -> bool {
        self.width == other.width && self.height == other.height
    }
}

// ── FrameView ────────────────────────────────────────────────────

/// A borrowed, linear frame region ready for conversion.
///
/// `data` holds `height` rows of `stride` bytes, except that the final
/// row may stop right after its last pixel.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub layout: PixelLayout,
}

impl<'a> FrameView<'a> {
    pub fn tight_stride(&self) -> usize {
        self.width as usize * self.layout.bytes_per_pixel()
    }

    /// Bytes needed to cover every pixel of the frame.
    pub fn required_len(&self) -> usize {
        required_len(self.stride as usize, self.tight_stride(), self.height as usize)
    }

    /// The pixel bytes of row `y`, without padding.
    pub fn row(&self, y: u32) -> &'a [u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.tight_stride()]
    }
}

/// Bytes spanned by `height` rows of `stride` whose last row is `row_len`
/// long.
pub fn required_len(stride: usize, row_len: usize, height: usize) -> usize {
    match height {
        0 => 0,
        h => stride * (h - 1) + row_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_from_spa_id() {
        assert_eq!(PixelLayout::try_from(7), Ok(PixelLayout::Rgbx));
        assert_eq!(PixelLayout::try_from(16), Ok(PixelLayout::Bgr));
        assert_eq!(PixelLayout::try_from(2), Err(2));
        assert_eq!(PixelLayout::try_from(17), Err(17));
    }

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(PixelLayout::Rgb.bytes_per_pixel(), 3);
        assert_eq!(PixelLayout::Bgr.bytes_per_pixel(), 3);
        assert_eq!(PixelLayout::Xrgb.bytes_per_pixel(), 4);
        assert_eq!(PixelLayout::Abgr.bytes_per_pixel(), 4);
    }

    #[test]
    fn rgb_offsets_match_names() {
        // xBGR stores X,B,G,R: red is the last byte.
        assert_eq!(PixelLayout::Xbgr.rgb_offsets(), [3, 2, 1]);
        assert_eq!(PixelLayout::Argb.rgb_offsets(), [1, 2, 3]);
        assert_eq!(PixelLayout::Bgr.rgb_offsets(), [2, 1, 0]);
    }

    #[test]
    fn drm_fourcc_codes() {
        assert_eq!(fourcc(b"XR24"), 0x3432_5258);
        assert_eq!(PixelLayout::Bgrx.drm_fourcc(), DRM_FORMAT_XRGB8888);
        assert_eq!(PixelLayout::Rgba.drm_fourcc(), 0x3432_4241);
    }

    #[test]
    fn stream_format_initial_stride() {
        let format = StreamFormat::new(PixelLayout::Rgb.as_raw(), 10, 4);
        assert_eq!(format.stride, 30);
        let unknown = StreamFormat::new(99, 10, 4);
        assert_eq!(unknown.layout(), None);
        assert_eq!(unknown.stride, 40);
    }

    #[test]
    fn frame_view_rows_skip_padding() {
        let data: Vec<u8> = (0..24).collect();
        let view = FrameView {
            data: &data,
            width: 2,
            height: 3,
            stride: 8,
            layout: PixelLayout::Rgb,
        };
        assert_eq!(view.required_len(), 22);
        assert_eq!(view.row(1), &[8, 9, 10, 11, 12, 13]);
    }
}
