//! Runs the pipeline headless over a synthetic feed: two objects drifting
//! right, one of them missed for a couple of cycles.
//!
//! cargo run --example replay [config.toml]

use std::thread;
use std::time::Duration;

use env_logger::Env;
use stickytrack::bbox::BBox;
use stickytrack::detector::{ScriptedDetector, Step};
use stickytrack::source::ReplaySource;
use stickytrack::{Detection, Error, Pipeline, PipelineConfig};

fn script() -> Vec<Step> {
    (0..30)
        .map(|i| {
            let x = i as f32 * 4.0;
            let mut dets = vec![Detection::new(BBox::ltrb(x, 40.0, x + 60.0, 160.0), "person", 0.91)];

            if !(10..12).contains(&i) {
                dets.push(Detection::new(
                    BBox::ltrb(300.0 + x, 200.0, 380.0 + x, 260.0),
                    "car",
                    0.76,
                ));
            }

            // below the default confidence threshold, never tracked
            dets.push(Detection::new(BBox::ltrb(600.0, 10.0, 620.0, 30.0), "bird", 0.2));

            Step::Detections(dets)
        })
        .collect()
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig {
            inference_fps: 10.0,
            ..Default::default()
        },
    };

    let mut pipeline = Pipeline::start_headless(
        config,
        ReplaySource::blank(640, 360),
        ScriptedDetector::new(script()),
    )?;

    for _ in 0..12 {
        thread::sleep(Duration::from_millis(250));

        let stats = pipeline.stats();
        println!(
            "t={:.2}s feed={:?} display={:.1}fps inference={:.1}fps ({:.1}ms)",
            pipeline.now(),
            pipeline.feed_status(),
            stats.display_fps,
            stats.inference_fps,
            stats.last_inference_ms,
        );

        for track in pipeline.active_tracks() {
            println!(
                "  #{} {} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}]",
                track.track_id,
                track.class,
                track.confidence,
                track.bbox.left(),
                track.bbox.top(),
                track.bbox.right(),
                track.bbox.bottom(),
            );
        }
    }

    pipeline.shutdown()
}
