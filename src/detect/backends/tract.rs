#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::config::ModelSettings;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};

/// Tract-based backend for quantized SSD-style ONNX detectors.
///
/// Input is a uint8 NHWC tensor `[1, H, W, 3]`. Outputs, in order:
/// 1. boxes `[1, N, 4]` as normalized `(ymin, xmin, ymax, xmax)`
/// 2. class ids `[1, N]`
/// 3. scores `[1, N]`
/// 4. optional valid-detection count `[1]`
///
/// Frames of any size are resized to the model input before inference.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    person_class_id: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load(model_path: &Path, settings: &ModelSettings) -> Result<Self> {
        let (width, height) = (settings.input_width, settings.input_height);
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    u8::datum_type(),
                    tvec!(1, height as usize, width as usize, 3),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            person_class_id: settings.person_class_id,
        })
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let frame = image::RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
        let resized = if (width, height) == (self.width, self.height) {
            frame
        } else {
            image::imageops::resize(&frame, self.width, self.height, FilterType::Triangle)
        };
        let input = tract_ndarray::Array4::from_shape_vec(
            (1, self.height as usize, self.width as usize, 3),
            resized.into_raw(),
        )
        .context("model input shape mismatch")?;
        Ok(input.into_tensor())
    }

    fn decode_outputs(&self, outputs: &TVec<TValue>) -> Result<Vec<Detection>> {
        if outputs.len() < 3 {
            return Err(anyhow!(
                "expected at least 3 model outputs (boxes, classes, scores), got {}",
                outputs.len()
            ));
        }
        let boxes = outputs[0]
            .to_array_view::<f32>()
            .context("boxes output was not f32")?;
        let classes = outputs[1]
            .to_array_view::<f32>()
            .context("classes output was not f32")?;
        let scores = outputs[2]
            .to_array_view::<f32>()
            .context("scores output was not f32")?;

        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let classes: Vec<f32> = classes.iter().copied().collect();
        let scores: Vec<f32> = scores.iter().copied().collect();

        let mut count = scores.len().min(classes.len()).min(boxes.len() / 4);
        if let Some(num) = outputs.get(3) {
            if let Ok(view) = num.to_array_view::<f32>() {
                if let Some(n) = view.iter().next() {
                    count = count.min(n.max(0.0) as usize);
                }
            }
        }

        let detections = (0..count)
            .map(|i| {
                let (ymin, xmin, ymax, xmax) =
                    (boxes[i * 4], boxes[i * 4 + 1], boxes[i * 4 + 2], boxes[i * 4 + 3]);
                let class = if classes[i].round() as i64 == self.person_class_id as i64 {
                    ObjectClass::Person
                } else {
                    ObjectClass::Other
                };
                Detection::new(
                    class,
                    scores[i],
                    BoundingBox {
                        x: xmin,
                        y: ymin,
                        w: xmax - xmin,
                        h: ymax - ymin,
                    },
                )
            })
            .collect();
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode_outputs(&outputs)
    }

    /// Run one blank frame through the model to confirm the output layout.
    fn warm_up(&self) -> Result<()> {
        let blank = vec![0u8; (self.width as usize) * (self.height as usize) * 3];
        self.detect(&blank, self.width, self.height)
            .map(|_| ())
            .context("model warm-up failed")
    }
}
