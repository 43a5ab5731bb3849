//! Sticky multi-object tracker.
//!
//! Tracks are matched greedily: existing tracks are visited in registry
//! order and each claims the unclaimed detection with the highest IoU. Ties
//! go to the detection that comes first in detector order. Unmatched tracks
//! survive for `max_age` seconds, unclaimed detections open new tracks.

use log::trace;
use parking_lot::Mutex;

use crate::{Detection, Track, Tracking};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MAX_AGE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    pub max_age: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Debug)]
pub struct StickyTracker {
    config: TrackerConfig,

    // insertion ordered, so ids are strictly increasing along the vec
    tracks: Vec<Track>,
    next_id: u64,
}

impl StickyTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Every track currently held, stale ones included.
    #[inline]
    pub fn registry(&self) -> &[Track] {
        &self.tracks
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[inline]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    fn best_match(&self, track: &Track, detections: &[Detection], claimed: &[bool]) -> Option<usize> {
        let mut best_iou = 0.0;
        let mut best_idx = None;

        for (idx, det) in detections.iter().enumerate() {
            if claimed[idx] {
                continue;
            }

            let iou = track.bbox.iou(&det.bbox);
            if iou > best_iou {
                best_iou = iou;
                best_idx = Some(idx);
            }
        }

        best_idx.filter(|_| best_iou >= self.config.iou_threshold)
    }
}

impl Default for StickyTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Tracking for StickyTracker {
    fn update(&mut self, detections: &[Detection], now: f64) {
        let mut claimed = vec![false; detections.len()];
        let tracks = std::mem::take(&mut self.tracks);
        let mut kept = Vec::with_capacity(tracks.len() + detections.len());

        for mut track in tracks {
            match self.best_match(&track, detections, &claimed) {
                Some(idx) => {
                    claimed[idx] = true;
                    track.adopt(&detections[idx], now);
                    kept.push(track);
                }
                None if track.is_fresh(now, self.config.max_age) => kept.push(track),
                None => trace!(
                    "drop track {} ({}), unseen for {:.3}s",
                    track.track_id,
                    track.class,
                    track.age(now)
                ),
            }
        }

        for (idx, det) in detections.iter().enumerate() {
            if claimed[idx] {
                continue;
            }

            let track_id = self.next_id;
            self.next_id += 1;

            trace!("new track {} ({})", track_id, det.class);
            kept.push(Track::from_detection(track_id, det, now));
        }

        self.tracks = kept;
    }

    fn get_active(&self, now: f64) -> Vec<Track> {
        self.tracks
            .iter()
            .filter(|t| t.is_fresh(now, self.config.max_age))
            .cloned()
            .collect()
    }
}

/// Registry guard shared by the two loops. Reads hand out owned copies only.
#[derive(Debug, Default)]
pub struct SharedTracker {
    inner: Mutex<StickyTracker>,
}

impl SharedTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            inner: Mutex::new(StickyTracker::new(config)),
        }
    }

    #[inline]
    pub fn update(&self, detections: &[Detection], now: f64) {
        self.inner.lock().update(detections, now)
    }

    #[inline]
    pub fn get_active(&self, now: f64) -> Vec<Track> {
        self.inner.lock().get_active(now)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
