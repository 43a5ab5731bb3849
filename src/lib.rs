pub mod bbox;
pub mod clock;
pub mod config;
pub mod detection;
pub mod detector;
pub mod error;
pub mod frame;
pub mod frame_bus;
pub mod pipeline;
pub mod source;
pub mod stats;
pub mod tracker;

#[cfg(feature = "opencv")]
pub mod camera;

mod circular_queue;
mod track;

pub use config::PipelineConfig;
pub use detection::Detection;
pub use detector::{Detect, DetectorAdapter};
pub use error::Error;
pub use frame::Frame;
pub use frame_bus::FrameBus;
pub use pipeline::{Pipeline, RenderControl, Renderer};
pub use source::{FeedStatus, FrameSource};
pub use track::Track;
pub use tracker::{SharedTracker, StickyTracker, TrackerConfig};

/// Per-cycle association of detections to tracks.
///
/// `now` is in seconds on a monotonic clock and must not go backwards
/// between calls.
pub trait Tracking {
    /// Matches `detections` against the registry, ages out stale tracks and
    /// opens tracks for whatever is left unmatched.
    fn update(&mut self, detections: &[Detection], now: f64);

    /// Tracks seen within `max_age` of `now`. Does not touch the registry.
    fn get_active(&self, now: f64) -> Vec<Track>;
}
