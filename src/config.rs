use std::path::Path;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::error::Error;
use crate::tracker::{TrackerConfig, DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_AGE};

pub const DEFAULT_CAPTURE_FPS: f64 = 14.0;
pub const DEFAULT_INFERENCE_FPS: f64 = 1.0;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Everything the two loops need. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub capture_fps: f64,
    pub inference_fps: f64,
    pub iou_threshold: f32,
    pub max_age: f64,
    pub confidence_threshold: f32,
    pub feed_timeout: f64,
    pub retry_backoff: f64,
    pub shutdown_timeout: f64,
    pub fps_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_fps: DEFAULT_CAPTURE_FPS,
            inference_fps: DEFAULT_INFERENCE_FPS,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_age: DEFAULT_MAX_AGE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            feed_timeout: 2.0,
            retry_backoff: 0.01,
            shutdown_timeout: 2.0,
            fps_window: 50,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let src = std::fs::read_to_string(path)?;

        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn positive(name: &str, value: f64) -> Result<(), Error> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{} must be > 0, got {}", name, value)))
            }
        }

        positive("capture_fps", self.capture_fps)?;
        positive("inference_fps", self.inference_fps)?;
        positive("feed_timeout", self.feed_timeout)?;
        positive("retry_backoff", self.retry_backoff)?;
        positive("shutdown_timeout", self.shutdown_timeout)?;

        self.capture_period()?;
        self.inference_period()?;
        self.retry_backoff()?;
        self.shutdown_timeout()?;

        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "iou_threshold must be in (0, 1], got {}",
                self.iou_threshold
            )));
        }

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::InvalidConfig(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }

        if !(self.max_age.is_finite() && self.max_age >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "max_age must be >= 0, got {}",
                self.max_age
            )));
        }

        if self.fps_window == 0 {
            return Err(Error::InvalidConfig("fps_window must be > 0".into()));
        }

        Ok(())
    }

    #[inline]
    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            iou_threshold: self.iou_threshold,
            max_age: self.max_age,
        }
    }

    pub fn capture_period(&self) -> Result<Duration, Error> {
        seconds("capture_fps", 1.0 / self.capture_fps)
    }

    pub fn inference_period(&self) -> Result<Duration, Error> {
        seconds("inference_fps", 1.0 / self.inference_fps)
    }

    pub fn retry_backoff(&self) -> Result<Duration, Error> {
        seconds("retry_backoff", self.retry_backoff)
    }

    pub fn shutdown_timeout(&self) -> Result<Duration, Error> {
        seconds("shutdown_timeout", self.shutdown_timeout)
    }
}

fn seconds(name: &str, secs: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(secs)
        .map_err(|err| Error::InvalidConfig(format!("{} gives no usable duration: {}", name, err)))
}
