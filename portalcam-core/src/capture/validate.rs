//! Frame filtering and sink-failure bookkeeping.
//!
//! - [`WarmupGate`] drops the first frames after every renegotiation;
//!   producers often deliver black or partially drawn frames there.
//! - [`FrameValidator`] rejects frames that are almost entirely black.
//! - [`WriteTracker`] counts consecutive sink failures and decides when
//!   the pipeline must stop.

use tracing::debug;

use crate::capture::types::FrameView;

/// Frames skipped after each format negotiation.
pub const DEFAULT_WARMUP_FRAMES: u32 = 5;
/// Fraction of sampled pixels that must carry colour.
pub const DEFAULT_MIN_VALID_RATIO: f64 = 0.01;
/// Upper bound on validator samples per frame.
pub const DEFAULT_MAX_SAMPLES: usize = 1000;
/// Consecutive write failures tolerated before shutdown.
pub const DEFAULT_MAX_WRITE_FAILURES: u32 = 5;

// ── WarmupGate ───────────────────────────────────────────────────

/// Skips a fixed number of frames after each reset.
#[derive(Debug, Clone)]
pub struct WarmupGate {
    frames: u32,
    seen: u32,
}

impl WarmupGate {
    pub fn new(frames: u32) -> Self {
        Self { frames, seen: 0 }
    }

    /// Start counting again; called on every format (re)negotiation.
    pub fn reset(&mut self) {
        self.seen = 0;
    }

    /// Returns `false` while still warming up.
    pub fn admit(&mut self) -> bool {
        if self.seen < self.frames {
            self.seen += 1;
            return false;
        }
        true
    }

    pub fn remaining(&self) -> u32 {
        self.frames - self.seen
    }
}

impl Default for WarmupGate {
    fn default() -> Self {
        Self::new(DEFAULT_WARMUP_FRAMES)
    }
}

// ── FrameValidator ───────────────────────────────────────────────

/// Sparse black-frame detector.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    min_ratio: f64,
    max_samples: usize,
}

/// Result of sampling one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub sampled: usize,
    pub coloured: usize,
}

impl Sampling {
    pub fn ratio(&self) -> f64 {
        match self.sampled {
            0 => 0.0,
            n => self.coloured as f64 / n as f64,
        }
    }
}

impl FrameValidator {
    pub fn new(min_ratio: f64, max_samples: usize) -> Self {
        Self {
            min_ratio,
            max_samples,
        }
    }

    /// Walk a sparse grid and count pixels with a non-zero colour byte.
    ///
    /// Rows step by `height / 100` (when taller than 100), columns by
    /// `width / 10` (when wider than 10).
    pub fn sample(&self, frame: &FrameView<'_>) -> Sampling {
        let y_step = if frame.height > 100 { frame.height / 100 } else { 1 };
        let x_step = if frame.width > 10 { frame.width / 10 } else { 1 };
        let bpp = frame.layout.bytes_per_pixel();
        let offsets = frame.layout.rgb_offsets();

        let mut sampling = Sampling {
            sampled: 0,
            coloured: 0,
        };
        'rows: for y in (0..frame.height).step_by(y_step as usize) {
            let row_start = y as usize * frame.stride as usize;
            for x in (0..frame.width).step_by(x_step as usize) {
                if sampling.sampled >= self.max_samples {
                    break 'rows;
                }
                let at = row_start + x as usize * bpp;
                let Some(px) = frame.data.get(at..at + bpp) else {
                    break 'rows;
                };
                sampling.sampled += 1;
                if offsets.iter().any(|&o| px[o] != 0) {
                    sampling.coloured += 1;
                }
            }
        }
        sampling
    }

    /// `true` when more than the minimum ratio of samples carry colour.
    pub fn check(&self, frame: &FrameView<'_>) -> bool {
        let sampling = self.sample(frame);
        sampling.sampled > 0 && sampling.ratio() > self.min_ratio
    }
}

impl Default for FrameValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_VALID_RATIO, DEFAULT_MAX_SAMPLES)
    }
}

// ── WriteTracker ─────────────────────────────────────────────────

/// What the pipeline should do after a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteVerdict {
    Continue,
    Shutdown,
}

/// Consecutive sink-failure counter.
#[derive(Debug, Clone)]
pub struct WriteTracker {
    limit: u32,
    consecutive: u32,
}

impl WriteTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// Record the outcome of one write.
    ///
    /// A failure while the session is gone, or the `limit`-th failure in
    /// a row, asks for shutdown. Any positive write resets the count; a
    /// zero-byte write changes nothing.
    pub fn record<E>(&mut self, result: &Result<usize, E>, session_active: bool) -> WriteVerdict {
        match result {
            Err(_) => {
                self.consecutive += 1;
                if !session_active || self.consecutive >= self.limit {
                    return WriteVerdict::Shutdown;
                }
                WriteVerdict::Continue
            }
            Ok(0) => WriteVerdict::Continue,
            Ok(_) => {
                if self.consecutive > 0 {
                    debug!(after = self.consecutive, "sink recovered");
                }
                self.consecutive = 0;
                WriteVerdict::Continue
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

impl Default for WriteTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WRITE_FAILURES)
    }
}

// ── FrameProbe ───────────────────────────────────────────────────

/// Logs a short description of the first few admitted frames.
#[derive(Debug, Clone)]
pub struct FrameProbe {
    remaining: u32,
}

impl FrameProbe {
    pub fn new(frames: u32) -> Self {
        Self { remaining: frames }
    }

    pub fn observe(&mut self, frame: &FrameView<'_>) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;

        let head = &frame.data[..frame.data.len().min(16)];
        let non_zero = frame.data.iter().take(4096).filter(|&&b| b != 0).count();
        debug!(
            layout = %frame.layout,
            width = frame.width,
            height = frame.height,
            stride = frame.stride,
            tight = frame.tight_stride(),
            ?head,
            "frame probe"
        );
        if non_zero == 0 {
            debug!("leading 4 KiB is all zero; source may be black or not yet drawn");
        }
    }
}

impl Default for FrameProbe {
    fn default() -> Self {
        Self::new(3)
    }
}
