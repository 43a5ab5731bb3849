//! OpenCV backed camera source and overlay window.

use log::{info, warn};
use opencv::{
    core::{self, Mat, Scalar},
    highgui, imgproc,
    prelude::*,
    videoio,
};

use crate::error::Error;
use crate::frame::Frame;
use crate::pipeline::{RenderControl, Renderer};
use crate::source::{FeedStatus, FrameSource};
use crate::stats::PipelineStats;
use crate::Track;

pub const DEFAULT_RESOLUTION: (i32, i32) = (1280, 720);

// BGR, one colour per class
const CLASS_COLORS: [(f64, f64, f64); 2] = [(0.0, 0.0, 255.0), (0.0, 255.0, 0.0)];

/// USB camera or video file, frames resized to a fixed resolution and
/// converted to RGB.
pub struct VideoSource {
    cap: videoio::VideoCapture,
    resolution: (i32, i32),
    raw: Mat,
    seq: u64,
}

impl VideoSource {
    pub fn usb(index: i32, resolution: (i32, i32)) -> Result<Self, Error> {
        let mut cap = videoio::VideoCapture::new(index, videoio::CAP_ANY)?;
        cap.set(videoio::CAP_PROP_FRAME_WIDTH, resolution.0 as f64)?;
        cap.set(videoio::CAP_PROP_FRAME_HEIGHT, resolution.1 as f64)?;

        Self::opened(cap, resolution, &format!("usb{}", index))
    }

    pub fn file(path: &str, resolution: (i32, i32)) -> Result<Self, Error> {
        let cap = videoio::VideoCapture::from_file(path, videoio::CAP_ANY)?;

        Self::opened(cap, resolution, path)
    }

    fn opened(cap: videoio::VideoCapture, resolution: (i32, i32), name: &str) -> Result<Self, Error> {
        if !videoio::VideoCapture::is_opened(&cap)? {
            return Err(Error::SourceInit(format!("unable to open {}", name)));
        }

        if resolution.0 <= 0 || resolution.1 <= 0 {
            return Err(Error::SourceInit(format!(
                "bad resolution {}x{}",
                resolution.0, resolution.1
            )));
        }

        info!("opened {} at {}x{}", name, resolution.0, resolution.1);

        Ok(Self {
            cap,
            resolution,
            raw: Mat::default(),
            seq: 0,
        })
    }
}

impl FrameSource for VideoSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        if !self.cap.read(&mut self.raw)? || self.raw.cols() == 0 || self.raw.rows() == 0 {
            return Ok(None);
        }

        let mut resized = Mat::default();
        imgproc::resize(
            &self.raw,
            &mut resized,
            core::Size::new(self.resolution.0, self.resolution.1),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&resized, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        self.seq += 1;
        let (w, h) = (self.resolution.0 as u32, self.resolution.1 as u32);
        let frame = Frame::from_raw(w, h, rgb.data_bytes()?.to_vec(), self.seq)
            .ok_or_else(|| Error::SourceRead("unexpected frame layout".into()))?;

        Ok(Some(frame))
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        let _ = self.cap.release();
    }
}

/// HighGUI window drawing sticky boxes, class names, FPS and object count.
/// `q` closes the pipeline.
pub struct WindowRenderer {
    title: String,
    labels: Vec<String>,
}

impl WindowRenderer {
    /// `labels` fixes the class to colour mapping.
    pub fn new<S: Into<String>>(title: S, labels: Vec<String>) -> Self {
        Self {
            title: title.into(),
            labels,
        }
    }

    fn color(&self, class: &str) -> Scalar {
        let idx = self.labels.iter().position(|l| l == class).unwrap_or(0);
        let (b, g, r) = CLASS_COLORS[idx % CLASS_COLORS.len()];

        Scalar::new(b, g, r, 0.0)
    }

    fn to_mat(frame: &Frame) -> Result<Mat, Error> {
        let (w, h) = frame.dims();
        let mut rgb = Mat::new_rows_cols_with_default(h as i32, w as i32, core::CV_8UC3, Scalar::all(0.0))?;

        let src = frame.pixels.as_slice().ok_or_else(|| Error::Render("frame not contiguous".into()))?;
        rgb.data_bytes_mut()?.copy_from_slice(src);

        let mut bgr = Mat::default();
        imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;

        Ok(bgr)
    }

    fn draw_track(&self, mat: &mut Mat, track: &Track) -> Result<(), Error> {
        let color = self.color(&track.class);
        let ltwh = track.bbox.as_ltwh();
        let rect = core::Rect::new(
            ltwh.left() as i32,
            ltwh.top() as i32,
            ltwh.width() as i32,
            ltwh.height() as i32,
        );

        imgproc::rectangle(mat, rect, color, 2, imgproc::LINE_8, 0)?;

        let font = imgproc::FONT_HERSHEY_SIMPLEX;
        let mut base_line = 0;
        let size = imgproc::get_text_size(&track.class, font, 1.0, 2, &mut base_line)?;
        let label_top = (track.bbox.top() as i32).max(size.height + 10);

        imgproc::rectangle(
            mat,
            core::Rect::new(
                rect.x,
                label_top - size.height - 10,
                size.width,
                size.height + base_line,
            ),
            color,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;

        imgproc::put_text(
            mat,
            &track.class,
            core::Point::new(rect.x, label_top - 7),
            font,
            1.0,
            Scalar::new(0.0, 0.0, 0.0, 0.0),
            2,
            imgproc::LINE_8,
            false,
        )?;

        Ok(())
    }

    fn draw_text(mat: &mut Mat, text: &str, y: i32) -> Result<(), Error> {
        imgproc::put_text(
            mat,
            text,
            core::Point::new(10, y),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.7,
            Scalar::new(0.0, 255.0, 255.0, 0.0),
            2,
            imgproc::LINE_8,
            false,
        )?;

        Ok(())
    }
}

impl Renderer for WindowRenderer {
    fn render(
        &mut self,
        frame: &Frame,
        tracks: &[Track],
        stats: &PipelineStats,
    ) -> Result<RenderControl, Error> {
        let mut mat = Self::to_mat(frame)?;

        for track in tracks {
            self.draw_track(&mut mat, track)?;
        }

        Self::draw_text(&mut mat, &format!("FPS: {:0.2}", stats.display_fps), 20)?;
        Self::draw_text(&mut mat, &format!("Objects: {}", tracks.len()), 40)?;

        highgui::imshow(&self.title, &mat)?;

        match highgui::wait_key(1)? {
            key if key == 'q' as i32 || key == 'Q' as i32 => Ok(RenderControl::Quit),
            _ => Ok(RenderControl::Continue),
        }
    }

    fn feed_changed(&mut self, status: FeedStatus) {
        let title = match status {
            FeedStatus::Unavailable => format!("{} (feed unavailable)", self.title),
            _ => self.title.clone(),
        };

        if let Err(err) = highgui::set_window_title(&self.title, &title) {
            warn!("capture: window title update failed: {}", err);
        }
    }
}

impl Drop for WindowRenderer {
    fn drop(&mut self) {
        let _ = highgui::destroy_window(&self.title);
    }
}
