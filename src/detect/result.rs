/// Object category reported by a detector.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    Person,
    Vehicle,
    Other,
}

impl ObjectClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Other => "other",
        }
    }
}

/// Axis-aligned box in frame-relative coordinates (0..1, origin top-left).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    /// Clip the box to the unit square.
    pub fn clamped(self) -> Self {
        let x0 = self.x.clamp(0.0, 1.0);
        let y0 = self.y.clamp(0.0, 1.0);
        let x1 = (self.x + self.w).clamp(0.0, 1.0);
        let y1 = (self.y + self.h).clamp(0.0, 1.0);
        Self {
            x: x0,
            y: y0,
            w: x1 - x0,
            h: y1 - y0,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.w.is_finite() && self.h.is_finite()
    }
}

/// One object found in one frame. Immutable once produced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub class: ObjectClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class: ObjectClass, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class,
            confidence,
            bbox,
        }
    }

    /// Confidence in [0, 1] and a finite box with some area inside the frame.
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
            && self.bbox.is_finite()
            && {
                let clipped = self.bbox.clamped();
                clipped.w > 0.0 && clipped.h > 0.0
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_boxes_hanging_off_the_frame() {
        let bbox = BoundingBox {
            x: -0.25,
            y: 0.5,
            w: 0.5,
            h: 0.75,
        }
        .clamped();
        assert_eq!(bbox.x, 0.0);
        assert_eq!(bbox.w, 0.25);
        assert_eq!(bbox.y, 0.5);
        assert_eq!(bbox.h, 0.5);
    }

    #[test]
    fn rejects_out_of_range_confidence_and_empty_boxes() {
        let bbox = BoundingBox {
            x: 0.1,
            y: 0.1,
            w: 0.2,
            h: 0.2,
        };
        assert!(Detection::new(ObjectClass::Person, 0.7, bbox).is_valid());
        assert!(!Detection::new(ObjectClass::Person, 1.5, bbox).is_valid());
        assert!(!Detection::new(ObjectClass::Person, f32::NAN, bbox).is_valid());

        let outside = BoundingBox {
            x: 1.5,
            y: 0.1,
            w: 0.2,
            h: 0.2,
        };
        assert!(!Detection::new(ObjectClass::Person, 0.7, outside).is_valid());
    }

    #[test]
    fn class_labels() {
        let labels: Vec<&str> = [ObjectClass::Person, ObjectClass::Vehicle, ObjectClass::Other]
            .into_iter()
            .map(ObjectClass::as_str)
            .collect();
        assert_eq!(labels, vec!["person", "vehicle", "other"]);
    }
}
