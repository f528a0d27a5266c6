//! Descriptor extraction: decode, locate, crop, resize, normalize.

use crate::descriptor::{Descriptor, DescriptorError, DESCRIPTOR_SIDE};
use crate::detector::{DetectorError, FaceLocator};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("face location failed: {0}")]
    Locate(#[from] DetectorError),
    #[error("descriptor construction failed: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// One face found in an image.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFace {
    pub bbox: BoundingBox,
    pub descriptor: Descriptor,
}

/// Turns encoded image bytes into face descriptors.
///
/// Implementations keep whatever model they load at construction and are
/// otherwise stateless per call. Faces come back in discovery order.
pub trait DescriptorExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Vec<ExtractedFace>, ExtractError>;
}

/// Raw-intensity descriptors over a pluggable face locator.
///
/// Each located box is clamped to the image, cropped from the luma channel,
/// resized to `DESCRIPTOR_SIDE`² with a triangle (bilinear) filter, and
/// scaled to `[0, 1]` in row-major order.
pub struct PixelExtractor {
    locator: Box<dyn FaceLocator>,
}

impl PixelExtractor {
    pub fn new(locator: impl FaceLocator + 'static) -> Self {
        Self { locator: Box::new(locator) }
    }

    fn describe(gray: &GrayImage, bbox: &BoundingBox) -> Result<Option<ExtractedFace>, ExtractError> {
        let Some(clamped) = clamp_to_image(bbox, gray.width(), gray.height()) else {
            tracing::debug!(?bbox, "located box lies outside the image; skipping");
            return Ok(None);
        };

        let crop = imageops::crop_imm(
            gray,
            clamped.x as u32,
            clamped.y as u32,
            clamped.width as u32,
            clamped.height as u32,
        )
        .to_image();
        let resized = imageops::resize(&crop, DESCRIPTOR_SIDE, DESCRIPTOR_SIDE, FilterType::Triangle);

        let values = resized.as_raw().iter().map(|&p| p as f32 / 255.0).collect();
        Ok(Some(ExtractedFace {
            bbox: clamped,
            descriptor: Descriptor::new(values)?,
        }))
    }
}

impl DescriptorExtractor for PixelExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<ExtractedFace>, ExtractError> {
        let gray = image::load_from_memory(image)?.to_luma8();
        if gray.width() == 0 || gray.height() == 0 {
            return Err(ExtractError::EmptyImage);
        }

        let boxes = self.locator.locate(gray.as_raw(), gray.width(), gray.height())?;

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in &boxes {
            if let Some(face) = Self::describe(&gray, bbox)? {
                faces.push(face);
            }
        }

        tracing::debug!(located = boxes.len(), described = faces.len(), "extraction complete");
        Ok(faces)
    }
}

/// Snap a box to whole pixels inside a `width`×`height` image.
/// Returns `None` when nothing of the box remains.
fn clamp_to_image(bbox: &BoundingBox, width: u32, height: u32) -> Option<BoundingBox> {
    let x0 = bbox.x.round().clamp(0.0, width as f32);
    let y0 = bbox.y.round().clamp(0.0, height as f32);
    let x1 = (bbox.x + bbox.width).round().clamp(0.0, width as f32);
    let y1 = (bbox.y + bbox.height).round().clamp(0.0, height as f32);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(BoundingBox {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
        confidence: bbox.confidence,
    })
}
