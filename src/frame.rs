use ndarray::Array3;

/// Raw pixel frame, `height x width x 3` channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub pixels: Array3<u8>,
    pub seq: u64,
}

impl Frame {
    #[inline]
    pub fn new(pixels: Array3<u8>, seq: u64) -> Self {
        Self { pixels, seq }
    }

    /// Black frame, mostly useful for doubles and tests.
    pub fn blank(width: u32, height: u32, seq: u64) -> Self {
        Self {
            pixels: Array3::zeros((height as usize, width as usize, 3)),
            seq,
        }
    }

    /// Wraps a tightly packed `HxWx3` buffer. Returns `None` on size mismatch.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>, seq: u64) -> Option<Self> {
        let pixels = Array3::from_shape_vec((height as usize, width as usize, 3), data).ok()?;

        Some(Self { pixels, seq })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.pixels.shape()[1] as u32
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.pixels.shape()[0] as u32
    }

    #[inline]
    pub fn dims(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}
