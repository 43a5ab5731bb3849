use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use ndarray::prelude::*;

use crate::bbox::BBox;
use crate::detection::Detection;
use crate::error::Error;
use crate::frame::Frame;

/// Detection backend contract. One implementation per backend.
pub trait Detect {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Error>;
}

impl<T: Detect + ?Sized> Detect for Box<T> {
    #[inline]
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Error> {
        (**self).detect(frame)
    }
}

/// Wraps a backend so that a failing cycle yields no detections instead of an error.
pub struct DetectorAdapter<D> {
    backend: D,
    failures: u64,
}

impl<D: Detect> DetectorAdapter<D> {
    pub fn new(backend: D) -> Self {
        Self {
            backend,
            failures: 0,
        }
    }

    /// Raw backend output, unfiltered. Errors and panics become an empty list.
    pub fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        let backend = &mut self.backend;

        match panic::catch_unwind(AssertUnwindSafe(|| backend.detect(frame))) {
            Ok(Ok(dets)) => {
                if dets.is_empty() {
                    debug!("frame {}: detector returned nothing", frame.seq);
                }
                dets
            }
            Ok(Err(err)) => {
                self.failures += 1;
                warn!("frame {}: detector failed: {}", frame.seq, err);
                Vec::new()
            }
            Err(_) => {
                self.failures += 1;
                warn!("frame {}: detector panicked", frame.seq);
                Vec::new()
            }
        }
    }

    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// Opaque model runtime. Takes a `[1, 3, H, W]` tensor scaled to `[0, 1]`.
pub trait InferenceModel {
    /// `(width, height)` of the model input.
    fn input_size(&self) -> (u32, u32);

    fn run(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[batch, predictions, 4 + classes]`
    PredictionsMajor,
    /// `[batch, 4 + classes, predictions]`, as exported by recent YOLO versions
    AttributesMajor,
}

#[derive(Debug, Clone)]
pub struct YoloDetectorConfig {
    pub labels: Vec<String>,
    pub min_score: f32,
    pub nms_iou: f32,
    pub layout: OutputLayout,
    // box coordinates relative to the model input instead of input pixels
    pub normalized: bool,
}

impl YoloDetectorConfig {
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            min_score: 0.01,
            nms_iou: 0.45,
            layout: OutputLayout::PredictionsMajor,
            normalized: true,
        }
    }
}

pub struct YoloDetector<M> {
    model: M,
    config: YoloDetectorConfig,
}

impl<M: InferenceModel> YoloDetector<M> {
    pub fn new(model: M, config: YoloDetectorConfig) -> Result<Self, Error> {
        if config.labels.is_empty() {
            return Err(Error::DetectorInit("no class labels".into()));
        }

        let (w, h) = model.input_size();
        if w == 0 || h == 0 {
            return Err(Error::DetectorInit(format!("bad model input size {}x{}", w, h)));
        }

        Ok(Self { model, config })
    }

    #[inline]
    pub fn labels(&self) -> &[String] {
        &self.config.labels
    }

    /// Nearest-neighbour resample into a `[1, 3, H, W]` tensor.
    fn preprocess(&self, frame: &Frame) -> Result<Array4<f32>, Error> {
        if frame.is_empty() {
            return Err(Error::Inference("empty frame".into()));
        }

        let (in_w, in_h) = self.model.input_size();
        let (in_w, in_h) = (in_w as usize, in_h as usize);
        let (fw, fh) = (frame.width() as usize, frame.height() as usize);
        let pixels = &frame.pixels;

        Ok(Array4::from_shape_fn((1, 3, in_h, in_w), |(_, c, y, x)| {
            let sy = y * fh / in_h;
            let sx = x * fw / in_w;

            pixels[[sy, sx, c]] as f32 / 255.0
        }))
    }

    fn postprocess(&self, output: ArrayD<f32>, frame: &Frame) -> Result<Vec<Detection>, Error> {
        let output = output
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::MalformedOutput(format!("expected 3 dims: {}", e)))?;

        let view = match self.config.layout {
            OutputLayout::PredictionsMajor => output.view(),
            OutputLayout::AttributesMajor => output.view().permuted_axes([0, 2, 1]),
        };

        let shape = view.shape();
        let (nbatches, npreds, pred_size) = (shape[0], shape[1], shape[2]);
        if nbatches == 0 {
            return Ok(Vec::new());
        }
        if pred_size < 5 {
            return Err(Error::MalformedOutput(format!(
                "prediction size {} leaves no class scores",
                pred_size
            )));
        }

        let nclasses = self.config.labels.len();
        let (fw, fh) = (frame.width() as f32, frame.height() as f32);
        let (sx, sy) = if self.config.normalized {
            (fw, fh)
        } else {
            let (in_w, in_h) = self.model.input_size();
            (fw / in_w as f32, fh / in_h as f32)
        };

        // The bounding boxes grouped by (maximum) class index.
        let mut grouped: Vec<Vec<Detection>> = (0..nclasses).map(|_| vec![]).collect();
        let batch = view.index_axis(Axis(0), 0);

        for index in 0..npreds {
            let pred = batch.index_axis(Axis(0), index);

            let mut class_index = None;
            let mut confidence = 0.0;
            for (idx, &val) in pred.iter().skip(4).enumerate() {
                if val > confidence {
                    class_index = Some(idx);
                    confidence = val;
                }
            }

            let class_index = match class_index {
                Some(idx) if confidence >= self.config.min_score => idx,
                _ => continue,
            };

            if !(0.0..=1.0).contains(&confidence) {
                return Err(Error::MalformedOutput(format!(
                    "confidence {} out of range",
                    confidence
                )));
            }

            if class_index >= nclasses {
                return Err(Error::MalformedOutput(format!(
                    "class index {} with {} labels",
                    class_index, nclasses
                )));
            }

            let bbox = BBox::xywh(pred[0] * sx, pred[1] * sy, pred[2] * sx, pred[3] * sy)
                .as_ltrb()
                .clamp_to(frame.width(), frame.height());

            if bbox.area() <= 0.0 {
                continue;
            }

            grouped[class_index].push(Detection::new(
                bbox,
                self.config.labels[class_index].clone(),
                confidence,
            ));
        }

        let mut results = Vec::new();
        for mut dets in grouped.into_iter() {
            if dets.len() > 1 {
                non_maximum_suppression(&mut dets, self.config.nms_iou);
            }

            results.append(&mut dets);
        }

        Ok(results)
    }
}

impl<M: InferenceModel> Detect for YoloDetector<M> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Error> {
        let input = self.preprocess(frame)?;
        let output = self.model.run(input)?;

        self.postprocess(output, frame)
    }
}

/// Keeps the most confident box of every overlapping cluster, most confident first.
pub fn non_maximum_suppression(dets: &mut Vec<Detection>, iou_threshold: f32) {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut retain = vec![true; dets.len()];
    for idx in 0..dets.len() {
        if !retain[idx] {
            continue;
        }

        for other in idx + 1..dets.len() {
            if retain[other] && dets[idx].iou(&dets[other]) > iou_threshold {
                retain[other] = false;
            }
        }
    }

    let mut keep = retain.into_iter();
    dets.retain(|_| keep.next().unwrap_or(false));
}

#[derive(Debug, Clone)]
pub enum Step {
    Detections(Vec<Detection>),
    Fail(String),
    Panic,
}

/// Deterministic backend replaying a fixed script. The last step repeats once
/// the script runs out.
#[derive(Debug)]
pub struct ScriptedDetector {
    steps: VecDeque<Step>,
    last: Step,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            last: Step::Detections(Vec::new()),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn constant(dets: Vec<Detection>) -> Self {
        Self::new([Step::Detections(dets)])
    }

    /// Sleeps this long on every call, to stand in for a slow model.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared call counter, readable after the detector moved to another thread.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Detect for ScriptedDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        if let Some(step) = self.steps.pop_front() {
            self.last = step;
        }

        match &self.last {
            Step::Detections(dets) => Ok(dets.clone()),
            Step::Fail(msg) => Err(Error::Inference(msg.clone())),
            Step::Panic => panic!("scripted detector panic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(xmin: f32, class: &str, conf: f32) -> Detection {
        Detection::new(BBox::ltrb(xmin, 0.0, xmin + 10.0, 10.0), class, conf)
    }

    struct FixedModel {
        size: (u32, u32),
        output: ArrayD<f32>,
        seen: Option<Array4<f32>>,
    }

    impl FixedModel {
        fn new(size: (u32, u32), output: ArrayD<f32>) -> Self {
            Self {
                size,
                output,
                seen: None,
            }
        }
    }

    impl InferenceModel for FixedModel {
        fn input_size(&self) -> (u32, u32) {
            self.size
        }

        fn run(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>, Error> {
            self.seen = Some(input);
            Ok(self.output.clone())
        }
    }

    struct BrokenModel;

    impl InferenceModel for BrokenModel {
        fn input_size(&self) -> (u32, u32) {
            (32, 32)
        }

        fn run(&mut self, _input: Array4<f32>) -> Result<ArrayD<f32>, Error> {
            Err(Error::Inference("runtime exploded".into()))
        }
    }

    fn predictions(rows: &[[f32; 6]]) -> ArrayD<f32> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Array3::from_shape_vec((1, rows.len(), 6), flat)
            .unwrap()
            .into_dyn()
    }

    fn labels() -> YoloDetectorConfig {
        YoloDetectorConfig::new(["cat", "dog"])
    }

    #[test]
    fn test_adapter_passes_detections_through() {
        let dets = vec![det(0.0, "cat", 0.2), det(20.0, "dog", 0.9)];
        let mut adapter = DetectorAdapter::new(ScriptedDetector::constant(dets.clone()));

        assert_eq!(adapter.detect(&Frame::blank(8, 8, 0)), dets);
        assert_eq!(adapter.failures(), 0);
    }

    #[test]
    fn test_adapter_swallows_errors_and_panics() {
        let script = vec![
            Step::Fail("model not loaded".into()),
            Step::Panic,
            Step::Detections(vec![det(0.0, "cat", 0.9)]),
        ];
        let mut adapter = DetectorAdapter::new(ScriptedDetector::new(script));
        let frame = Frame::blank(8, 8, 0);

        assert!(adapter.detect(&frame).is_empty());
        assert!(adapter.detect(&frame).is_empty());
        assert_eq!(adapter.detect(&frame).len(), 1);
        assert_eq!(adapter.failures(), 2);
    }

    #[test]
    fn test_adapter_with_broken_model() {
        let yolo = YoloDetector::new(BrokenModel, labels()).unwrap();
        let mut adapter = DetectorAdapter::new(yolo);

        assert!(adapter.detect(&Frame::blank(64, 64, 3)).is_empty());
        assert_eq!(adapter.failures(), 1);
    }

    #[test]
    fn test_scripted_repeats_last_step() {
        let mut scripted = ScriptedDetector::new([
            Step::Detections(vec![]),
            Step::Detections(vec![det(0.0, "cat", 0.9)]),
        ]);
        let counter = scripted.call_counter();
        let frame = Frame::blank(8, 8, 0);

        assert!(scripted.detect(&frame).unwrap().is_empty());
        assert_eq!(scripted.detect(&frame).unwrap().len(), 1);
        assert_eq!(scripted.detect(&frame).unwrap().len(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_yolo_init_checks() {
        let empty = YoloDetectorConfig::new(Vec::<String>::new());
        assert!(YoloDetector::new(BrokenModel, empty).is_err());

        let model = FixedModel::new((0, 32), predictions(&[]));
        assert!(YoloDetector::new(model, labels()).is_err());
    }

    #[test]
    fn test_yolo_preprocess_shape_and_scale() {
        let model = FixedModel::new((4, 2), predictions(&[]));
        let mut yolo = YoloDetector::new(model, labels()).unwrap();

        let mut frame = Frame::blank(8, 4, 0);
        frame.pixels.fill(255);
        yolo.detect(&frame).unwrap();

        let seen = yolo.model.seen.as_ref().unwrap();
        assert_eq!(seen.shape(), &[1, 3, 2, 4]);
        assert!(seen.iter().all(|&v| (v - 1.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_yolo_decodes_to_frame_pixels() {
        let output = predictions(&[
            // cx, cy, w, h, cat, dog
            [0.25, 0.5, 0.1, 0.2, 0.9, 0.1],
            [0.75, 0.5, 0.1, 0.2, 0.2, 0.6],
            [0.5, 0.5, 0.1, 0.1, 0.001, 0.002],
        ]);
        let model = FixedModel::new((32, 32), output);
        let mut yolo = YoloDetector::new(model, labels()).unwrap();

        let dets = yolo.detect(&Frame::blank(200, 100, 0)).unwrap();

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class, "cat");
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        let b = dets[0].bbox.as_slice();
        assert!((b[0] - 40.0).abs() < 1e-4);
        assert!((b[1] - 40.0).abs() < 1e-4);
        assert!((b[2] - 60.0).abs() < 1e-4);
        assert!((b[3] - 60.0).abs() < 1e-4);
        assert_eq!(dets[1].class, "dog");
    }

    #[test]
    fn test_yolo_attributes_major_layout() {
        // [1, 6, 1]
        let output = Array3::from_shape_vec((1, 6, 1), vec![0.5, 0.5, 0.5, 0.5, 0.1, 0.8])
            .unwrap()
            .into_dyn();
        let model = FixedModel::new((32, 32), output);
        let mut config = labels();
        config.layout = OutputLayout::AttributesMajor;
        let mut yolo = YoloDetector::new(model, config).unwrap();

        let dets = yolo.detect(&Frame::blank(100, 100, 0)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class, "dog");
        assert_eq!(dets[0].bbox.as_slice(), &[25.0, 25.0, 75.0, 75.0]);
    }

    #[test]
    fn test_yolo_rejects_malformed_output() {
        let flat = Array2::<f32>::zeros((3, 6)).into_dyn();
        let mut yolo = YoloDetector::new(FixedModel::new((32, 32), flat), labels()).unwrap();
        assert!(matches!(
            yolo.detect(&Frame::blank(10, 10, 0)),
            Err(Error::MalformedOutput(_))
        ));

        // three class scores for two labels
        let output = Array3::from_shape_vec((1, 1, 7), vec![0.5, 0.5, 0.2, 0.2, 0.0, 0.1, 0.9])
            .unwrap()
            .into_dyn();
        let mut yolo = YoloDetector::new(FixedModel::new((32, 32), output), labels()).unwrap();
        assert!(matches!(
            yolo.detect(&Frame::blank(10, 10, 0)),
            Err(Error::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_nms_keeps_best_of_cluster() {
        let mut dets = vec![
            det(0.0, "cat", 0.6),
            det(1.0, "cat", 0.9),
            det(50.0, "cat", 0.5),
        ];
        non_maximum_suppression(&mut dets, 0.45);

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].bbox.left(), 1.0);
        assert_eq!(dets[1].bbox.left(), 50.0);
    }

    #[test]
    fn test_yolo_nms_is_per_class() {
        let output = predictions(&[
            [0.5, 0.5, 0.2, 0.2, 0.9, 0.0],
            [0.5, 0.5, 0.2, 0.2, 0.0, 0.8],
            [0.51, 0.5, 0.2, 0.2, 0.7, 0.0],
        ]);
        let mut yolo = YoloDetector::new(FixedModel::new((32, 32), output), labels()).unwrap();

        let dets = yolo.detect(&Frame::blank(100, 100, 0)).unwrap();
        let classes: Vec<_> = dets.iter().map(|d| d.class.as_str()).collect();
        assert_eq!(classes, vec!["cat", "dog"]);
    }
}
