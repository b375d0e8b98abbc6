use image::RgbImage;

/// A decoded RGB24 video frame tagged with its position in the source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp: f64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, fps: f64, image: RgbImage) -> Self {
        let timestamp = if fps > 0.0 { index as f64 / fps } else { 0.0 };
        Self {
            index,
            timestamp,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Raw interleaved RGB bytes, the layout ffmpeg expects for `-pix_fmt rgb24`
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Replace the pixel data, keeping index and timestamp
    pub fn with_image(self, image: RgbImage) -> Self {
        Self { image, ..self }
    }
}

/// Result of running the transform on one frame.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    Ready(Frame),
    /// The transform failed; the frame is dropped but its slot in the display
    /// order is still consumed.
    Failed { index: u64, reason: String },
}

impl FrameOutcome {
    pub fn index(&self) -> u64 {
        match self {
            FrameOutcome::Ready(frame) => frame.index,
            FrameOutcome::Failed { index, .. } => *index,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, FrameOutcome::Ready(_))
    }
}
