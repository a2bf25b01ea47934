//! Test-pattern frames for exercising the output device without a
//! screencast session.

use crate::capture::sink::{OutputPixelFormat, SinkFormat};

/// Default pattern geometry and rate.
pub const PATTERN_WIDTH: u32 = 1280;
pub const PATTERN_HEIGHT: u32 = 720;
pub const PATTERN_FPS: u32 = 30;

/// Eight vertical bars, left to right: white, yellow, cyan, green,
/// magenta, red, blue, black.
const BARS_RGB: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

/// The same bars as studio-range `Y U Y V` macropixels.
const BARS_YUYV: [[u8; 4]; 8] = [
    [235, 128, 235, 128],
    [210, 16, 210, 146],
    [170, 166, 170, 16],
    [145, 54, 145, 34],
    [106, 202, 106, 222],
    [81, 90, 81, 240],
    [41, 240, 41, 110],
    [16, 128, 16, 128],
];

fn bar_index(x: u32, width: u32) -> usize {
    ((x as u64 * BARS_RGB.len() as u64) / u64::from(width.max(1))) as usize
}

/// Render one colour-bar frame in `format`.
pub fn color_bars(format: &SinkFormat) -> Vec<u8> {
    let mut row = Vec::with_capacity(format.bytes_per_line() as usize);
    match format.pixel_format {
        OutputPixelFormat::Yuyv => {
            for x in (0..format.width).step_by(2) {
                let mp = BARS_YUYV[bar_index(x, format.width)];
                let take = if x + 1 < format.width { 4 } else { 2 };
                row.extend_from_slice(&mp[..take]);
            }
        }
        OutputPixelFormat::Xrgb32 => {
            for x in 0..format.width {
                let [r, g, b] = BARS_RGB[bar_index(x, format.width)];
                row.extend_from_slice(&[b, g, r, 0xFF]);
            }
        }
    }
    row.repeat(format.height as usize)
}
