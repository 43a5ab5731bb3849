use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Ltrb};

/// One object found in a single frame. Lives for one inference cycle only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox<Ltrb>,
    #[serde(rename = "c")]
    pub class: String,
    #[serde(rename = "p")]
    pub confidence: f32,
}

impl Detection {
    pub fn new<S: Into<String>>(bbox: BBox<Ltrb>, class: S, confidence: f32) -> Self {
        Self {
            bbox,
            class: class.into(),
            confidence,
        }
    }

    #[inline]
    pub fn iou(&self, other: &Detection) -> f32 {
        self.bbox.iou(&other.bbox)
    }
}

/// Keeps detections with `confidence >= threshold`, preserving detector order.
pub fn filter_by_confidence(detections: &[Detection], threshold: f32) -> Vec<Detection> {
    detections
        .iter()
        .filter(|det| det.confidence >= threshold)
        .cloned()
        .collect()
}
