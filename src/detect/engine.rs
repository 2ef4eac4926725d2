//! Inference engine.
//!
//! Owns the loaded detector for the life of the process and exposes a single pure
//! operation, `detect(frame)`. A frame the backend cannot handle yields an empty set;
//! a model that cannot be loaded is fatal at startup.

use anyhow::Result;
use std::path::Path;

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use super::result::Detection;
use crate::config::ModelSettings;
use crate::error::{FailureKind, FatalError};
use crate::frame::Frame;

pub struct InferenceEngine {
    backend: Box<dyn DetectorBackend>,
    model: String,
}

impl InferenceEngine {
    /// Load the model named by `settings.path` and check it once.
    pub fn load(settings: &ModelSettings) -> Result<Self> {
        let backend: Box<dyn DetectorBackend> =
            if let Some(options) = settings.path.strip_prefix("stub://") {
                Box::new(
                    StubBackend::parse(options)
                        .map_err(|e| FatalError::wrap(FailureKind::ModelLoad, e))?,
                )
            } else {
                load_model_file(Path::new(&settings.path), settings)?
            };
        Self::from_backend(backend, settings.path.clone())
    }

    /// Wrap an already-constructed backend. Runs the backend's warm-up check.
    pub fn from_backend(backend: Box<dyn DetectorBackend>, model: String) -> Result<Self> {
        backend
            .warm_up()
            .map_err(|e| FatalError::wrap(FailureKind::ModelLoad, e))?;
        log::info!(
            "InferenceEngine: loaded {} backend ({})",
            backend.name(),
            model
        );
        Ok(Self { backend, model })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Detect objects in one frame.
    ///
    /// Never fails: a malformed frame or a backend error is logged and reported as no
    /// detections. Invalid detections are dropped and boxes are clipped to the frame.
    pub fn detect(&self, frame: &Frame) -> Vec<Detection> {
        if !frame.is_well_formed() {
            log::warn!(
                "InferenceEngine: frame {} is malformed ({}x{}, {} bytes); no detections",
                frame.seq,
                frame.width,
                frame.height,
                frame.byte_len()
            );
            return Vec::new();
        }
        match self
            .backend
            .detect(frame.pixels(), frame.width, frame.height)
        {
            Ok(detections) => detections
                .into_iter()
                .filter(Detection::is_valid)
                .map(|d| Detection::new(d.class, d.confidence, d.bbox.clamped()))
                .collect(),
            Err(err) => {
                log::warn!(
                    "InferenceEngine: detection failed on frame {}: {:#}; no detections",
                    frame.seq,
                    err
                );
                Vec::new()
            }
        }
    }
}

fn load_model_file(path: &Path, settings: &ModelSettings) -> Result<Box<dyn DetectorBackend>> {
    if !path.is_file() {
        return Err(FatalError::model_load(format!("model file not found: {}", path.display())).into());
    }
    #[cfg(feature = "backend-tract")]
    {
        let backend = super::backends::TractBackend::load(path, settings)
            .map_err(|e| FatalError::wrap(FailureKind::ModelLoad, e))?;
        Ok(Box::new(backend))
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = settings;
        Err(FatalError::model_load(format!(
            "cannot load {}: ONNX models require the backend-tract feature",
            path.display()
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EdgeConfig;
    use crate::detect::result::{BoundingBox, ObjectClass};
    use crate::error::failure_kind;

    fn settings(path: &str) -> ModelSettings {
        let mut settings = EdgeConfig::default().model;
        settings.path = path.to_string();
        settings
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
            anyhow::bail!("tensor shape mismatch")
        }
    }

    struct SloppyBackend;

    impl DetectorBackend for SloppyBackend {
        fn name(&self) -> &'static str {
            "sloppy"
        }

        fn detect(&self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
            let bbox = BoundingBox {
                x: 0.9,
                y: 0.9,
                w: 0.5,
                h: 0.5,
            };
            Ok(vec![
                Detection::new(ObjectClass::Person, 0.8, bbox),
                Detection::new(ObjectClass::Person, 2.0, bbox),
            ])
        }
    }

    #[test]
    fn missing_model_file_is_a_model_load_failure() {
        let err = InferenceEngine::load(&settings("/nonexistent/model.onnx"))
            .err()
            .expect("load must fail");
        assert_eq!(failure_kind(&err), Some(FailureKind::ModelLoad));
    }

    #[test]
    fn bad_stub_options_are_a_model_load_failure() {
        let err = InferenceEngine::load(&settings("stub://people=x"))
            .err()
            .expect("load must fail");
        assert_eq!(failure_kind(&err), Some(FailureKind::ModelLoad));
    }

    #[test]
    fn detect_is_deterministic() -> Result<()> {
        let engine = InferenceEngine::load(&settings("stub://"))?;
        let a = Frame::new(vec![9u8; 4 * 4 * 3], 4, 4, 0, 0);
        let b = Frame::new(vec![9u8; 4 * 4 * 3], 4, 4, 1, 5);
        assert_eq!(engine.detect(&a), engine.detect(&b));
        Ok(())
    }

    #[test]
    fn malformed_frame_yields_no_detections() -> Result<()> {
        let engine = InferenceEngine::load(&settings("stub://people=4"))?;
        let corrupt = Frame::new(vec![1u8; 7], 4, 4, 0, 0);
        assert!(engine.detect(&corrupt).is_empty());
        Ok(())
    }

    #[test]
    fn backend_errors_yield_no_detections() -> Result<()> {
        let engine = InferenceEngine::from_backend(Box::new(FailingBackend), "test".into())?;
        let frame = Frame::new(vec![0u8; 2 * 2 * 3], 2, 2, 0, 0);
        assert!(engine.detect(&frame).is_empty());
        Ok(())
    }

    #[test]
    fn invalid_detections_are_dropped_and_boxes_clipped() -> Result<()> {
        let engine = InferenceEngine::from_backend(Box::new(SloppyBackend), "test".into())?;
        let frame = Frame::new(vec![0u8; 2 * 2 * 3], 2, 2, 0, 0);
        let detections = engine.detect(&frame);
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert!(bbox.x + bbox.w <= 1.0);
        assert!(bbox.y + bbox.h <= 1.0);
        Ok(())
    }
}
