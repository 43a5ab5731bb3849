use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Ltrb};
use crate::Detection;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Track {
    pub track_id: u64,
    pub bbox: BBox<Ltrb>,
    pub class: String,
    pub confidence: f32,

    // seconds on the pipeline clock
    pub last_seen: f64,
}

impl Track {
    pub(crate) fn from_detection(track_id: u64, det: &Detection, now: f64) -> Self {
        Self {
            track_id,
            bbox: det.bbox,
            class: det.class.clone(),
            confidence: det.confidence,
            last_seen: now,
        }
    }

    /// Adopts box, class and confidence of a matched detection.
    pub(crate) fn adopt(&mut self, det: &Detection, now: f64) {
        self.bbox = det.bbox;
        self.class.clone_from(&det.class);
        self.confidence = det.confidence;
        self.last_seen = self.last_seen.max(now);
    }

    #[inline]
    pub fn age(&self, now: f64) -> f64 {
        now - self.last_seen
    }

    #[inline]
    pub fn is_fresh(&self, now: f64, max_age: f64) -> bool {
        self.age(now) <= max_age
    }
}
