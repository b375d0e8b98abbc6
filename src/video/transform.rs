use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use crate::core::Frame;

#[derive(Debug, Error)]
#[error("transform failed on frame {index}: {reason}")]
pub struct TransformError {
    pub index: u64,
    pub reason: String,
}

impl TransformError {
    pub fn new(index: u64, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

/// Per-frame processing step (face swap inference in the application).
///
/// Called concurrently from worker threads. It may be slow and may fail; it
/// may also change the output resolution.
pub trait FrameTransform: Send + Sync {
    fn apply(&self, frame: &Frame) -> Result<RgbImage, TransformError>;
}

impl<F> FrameTransform for F
where
    F: Fn(&Frame) -> Result<RgbImage, TransformError> + Send + Sync,
{
    fn apply(&self, frame: &Frame) -> Result<RgbImage, TransformError> {
        self(frame)
    }
}

pub struct IdentityTransform;

impl FrameTransform for IdentityTransform {
    fn apply(&self, frame: &Frame) -> Result<RgbImage, TransformError> {
        Ok(frame.image.clone())
    }
}

pub struct ResizeTransform {
    pub width: u32,
    pub height: u32,
    pub filter: FilterType,
}

impl ResizeTransform {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            filter: FilterType::Triangle,
        }
    }
}

impl FrameTransform for ResizeTransform {
    fn apply(&self, frame: &Frame) -> Result<RgbImage, TransformError> {
        if self.width == 0 || self.height == 0 {
            return Err(TransformError::new(frame.index, "target size is empty"));
        }
        Ok(imageops::resize(&frame.image, self.width, self.height, self.filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_changes_dimensions() {
        let frame = Frame::new(0, 10.0, RgbImage::new(640, 480));
        let out = ResizeTransform::new(720, 540).apply(&frame).unwrap();
        assert_eq!(out.dimensions(), (720, 540));
    }

    #[test]
    fn test_resize_to_zero_fails() {
        let frame = Frame::new(4, 10.0, RgbImage::new(8, 8));
        let err = ResizeTransform::new(0, 8).apply(&frame).unwrap_err();
        assert_eq!(err.index, 4);
    }

    #[test]
    fn test_closure_transform() {
        let invert = |frame: &Frame| -> Result<RgbImage, TransformError> {
            let mut image = frame.image.clone();
            imageops::invert(&mut image);
            Ok(image)
        };
        let frame = Frame::new(1, 10.0, RgbImage::new(2, 2));
        let out = invert.apply(&frame).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [255, 255, 255]);
    }
}
