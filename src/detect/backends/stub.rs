use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};

const STUB_PERSON_CONFIDENCE: f32 = 0.9;

/// Deterministic backend for tests and bring-up.
///
/// - `stub://people=N`: every frame contains exactly N confident people.
/// - `stub://`: the scene is derived from the first pixel byte. It holds
///   `pixels[0] % 16` confident people, one low-confidence person and one vehicle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubBackend {
    fixed_people: Option<usize>,
}

impl StubBackend {
    /// Parse the part of a `stub://` model spec after the scheme.
    pub fn parse(options: &str) -> Result<Self> {
        let options = options.trim().trim_end_matches('/');
        if options.is_empty() {
            return Ok(Self { fixed_people: None });
        }
        let count = options
            .strip_prefix("people=")
            .ok_or_else(|| anyhow!("unknown stub model option '{}'", options))?;
        let count = count
            .parse()
            .map_err(|_| anyhow!("stub model people count must be an integer, got '{}'", count))?;
        Ok(Self {
            fixed_people: Some(count),
        })
    }

    pub fn with_people(count: usize) -> Self {
        Self {
            fixed_people: Some(count),
        }
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let expected = (width as usize) * (height as usize) * 3;
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(anyhow!(
                "malformed frame: {}x{} with {} bytes",
                width,
                height,
                pixels.len()
            ));
        }

        if let Some(count) = self.fixed_people {
            return Ok(grid_people(count, STUB_PERSON_CONFIDENCE));
        }

        let count = (pixels[0] % 16) as usize;
        let mut detections = grid_people(count, 0.8);
        detections.push(Detection::new(
            ObjectClass::Person,
            0.3,
            BoundingBox {
                x: 0.9,
                y: 0.9,
                w: 0.05,
                h: 0.08,
            },
        ));
        detections.push(Detection::new(
            ObjectClass::Vehicle,
            0.7,
            BoundingBox {
                x: 0.0,
                y: 0.8,
                w: 0.3,
                h: 0.2,
            },
        ));
        Ok(detections)
    }
}

/// Lay `count` people out on a square grid so boxes never overlap.
fn grid_people(count: usize, confidence: f32) -> Vec<Detection> {
    if count == 0 {
        return Vec::new();
    }
    let cols = (count as f64).sqrt().ceil() as usize;
    let cell = 1.0 / cols as f32;
    (0..count)
        .map(|i| {
            let (row, col) = (i / cols, i % cols);
            Detection::new(
                ObjectClass::Person,
                confidence,
                BoundingBox {
                    x: col as f32 * cell + cell * 0.1,
                    y: row as f32 * cell + cell * 0.1,
                    w: cell * 0.8,
                    h: cell * 0.8,
                },
            )
        })
        .collect()
}
