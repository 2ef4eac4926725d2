use anyhow::Result;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// # Audit Boundary
///
/// Implementations receive pixels only for the duration of one `detect` call and
/// MUST NOT:
/// - Keep a copy of the pixels
/// - Write to disk
/// - Make network requests
///
/// `detect` takes `&self`: the only state a backend may carry between calls is its
/// loaded model, so identical frames always yield identical detections.
pub trait DetectorBackend {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one packed RGB24 frame.
    ///
    /// An `Err` is treated by the engine as "no detections this frame".
    fn detect(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Checked once at load time. Failing here is a model-load failure.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
