//! Frame ownership.
//!
//! A `Frame` is produced by a source, handed to exactly one pipeline iteration and
//! dropped there, whether it was inferred on or skipped. Raw pixels never leave the
//! device:
//!
//! - `Frame` is not `Clone` and has no public byte accessor.
//! - Pixels are only lent to a `DetectorBackend` for the duration of one `detect` call.
//! - Pixel memory is zeroized on drop.
//!
//! Everything downstream of inference works on `FrameMeta`, which carries no pixels.

use anyhow::{anyhow, Result};
use std::time::Instant;
use zeroize::Zeroize;

/// Pixel-free description of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameMeta {
    /// Monotonic per-source sequence number, starting at 0.
    pub seq: u64,
    /// Capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
    pub width: u32,
    pub height: u32,
}

/// One decoded RGB24 image sample.
pub struct Frame {
    /// Private pixel data. MUST NOT be exposed via any public API.
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub seq: u64,
    pub captured_at_ms: u64,
    /// Monotonic capture instant (for latency accounting, not exported).
    capture_instant: Instant,
}

// Explicitly NOT implementing Clone, AsRef<[u8]>, or any byte-exposing trait.

impl Frame {
    /// Create a frame from packed RGB24 pixels.
    ///
    /// The pixel length is not checked here; a malformed frame is the inference
    /// engine's problem and yields an empty detection set.
    pub fn new(data: Vec<u8>, width: u32, height: u32, seq: u64, captured_at_ms: u64) -> Self {
        Self {
            data,
            width,
            height,
            seq,
            captured_at_ms,
            capture_instant: Instant::now(),
        }
    }

    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            seq: self.seq,
            captured_at_ms: self.captured_at_ms,
            width: self.width,
            height: self.height,
        }
    }

    /// Expected byte length of a well-formed RGB24 frame of this size.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(3))
    }

    /// True when the pixel buffer matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.expected_len() == Some(self.data.len())
    }

    /// Milliseconds since this frame was captured.
    pub fn age_ms(&self) -> u128 {
        self.capture_instant.elapsed().as_millis()
    }

    /// Internal: pixels are only lent to detector backends.
    pub(crate) fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Zeroize raw pixel data on drop to limit exposure window.
        self.data.zeroize();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at_ms", &self.captured_at_ms)
            .field("bytes", &self.byte_len())
            .finish()
    }
}

/// Copy a strided RGB24 plane into tightly packed rows.
///
/// Decoders pad rows to an alignment boundary; `stride` is the padded row length in bytes.
pub fn pack_rgb_rows(data: &[u8], stride: usize, width: u32, height: u32) -> Result<Vec<u8>> {
    let row_bytes = width as usize * 3;
    let packed_len = row_bytes * height as usize;
    if stride < row_bytes {
        return Err(anyhow!(
            "stride {} is shorter than a {}-pixel row",
            stride,
            width
        ));
    }
    if stride == row_bytes {
        return data
            .get(..packed_len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| anyhow!("{} bytes cannot hold {}x{} RGB", data.len(), width, height));
    }

    let mut pixels = Vec::with_capacity(packed_len);
    for row in data.chunks(stride).take(height as usize) {
        let row = row
            .get(..row_bytes)
            .ok_or_else(|| anyhow!("truncated row in {}x{} image", width, height))?;
        pixels.extend_from_slice(row);
    }
    if pixels.len() != packed_len {
        return Err(anyhow!("image has fewer than {} rows", height));
    }
    Ok(pixels)
}
