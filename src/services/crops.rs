//! Crop and composition primitives shared by labeling and export.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, RgbImage, imageops};

use crate::models::BoundingBox;
use crate::services::error::AnnotationError;

/// Fit a box to an image: cap width/height to the image dimensions, then
/// clamp the origin so the whole box lies inside `[0,w) x [0,h)`.
pub fn fit_box(
    bbox: &BoundingBox,
    image_width: u32,
    image_height: u32,
) -> Result<BoundingBox, AnnotationError> {
    if bbox.width <= 0 || bbox.height <= 0 {
        return Err(AnnotationError::InvalidBox(
            "width and height must be positive".to_string(),
        ));
    }
    let width = bbox.width.min(image_width as i64);
    let height = bbox.height.min(image_height as i64);
    let x = bbox.x.clamp(0, image_width as i64 - width);
    let y = bbox.y.clamp(0, image_height as i64 - height);
    Ok(BoundingBox {
        x,
        y,
        width,
        height,
    })
}

/// Extract the sub-image under a fitted box.
pub fn crop(image: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    image.crop_imm(
        bbox.x as u32,
        bbox.y as u32,
        bbox.width as u32,
        bbox.height as u32,
    )
}

/// Place two images side by side on a black canvas. Canvas height is the
/// larger of the two, both images are top-aligned, the left one at x = 0.
pub fn compose_side_by_side(left: &DynamicImage, right: &DynamicImage) -> DynamicImage {
    let (lw, lh) = left.dimensions();
    let (rw, rh) = right.dimensions();
    let mut canvas = RgbImage::new(lw + rw, lh.max(rh));
    imageops::replace(&mut canvas, &left.to_rgb8(), 0, 0);
    imageops::replace(&mut canvas, &right.to_rgb8(), lw as i64, 0);
    DynamicImage::ImageRgb8(canvas)
}

/// JPEG-encode an image into a byte buffer.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, AnnotationError> {
    let mut output = Cursor::new(Vec::new());
    image
        .write_to(&mut output, image::ImageFormat::Jpeg)
        .map_err(|e| AnnotationError::EncodeFailure(e.to_string()))?;
    Ok(output.into_inner())
}

/// Decode an image from raw file bytes.
pub fn decode(data: &[u8]) -> Result<DynamicImage, AnnotationError> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| AnnotationError::EncodeFailure(e.to_string()))?
        .decode()
        .map_err(|e| AnnotationError::EncodeFailure(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: i64, y: i64, width: i64, height: i64) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width,
            height,
        }
    }

    #[test]
    fn fit_box_rejects_non_positive_dimensions() {
        assert!(fit_box(&bbox(0, 0, 0, 10), 100, 100).is_err());
        assert!(fit_box(&bbox(0, 0, 10, -1), 100, 100).is_err());
    }

    #[test]
    fn fit_box_keeps_inner_boxes_unchanged() {
        let fitted = fit_box(&bbox(10, 20, 30, 40), 100, 100).unwrap();
        assert_eq!(fitted, bbox(10, 20, 30, 40));
    }

    #[test]
    fn fit_box_output_always_lies_inside_the_image() {
        let cases = [
            bbox(-50, -50, 30, 30),
            bbox(90, 90, 30, 30),
            bbox(0, 0, 500, 500),
            bbox(200, -10, 10, 700),
            bbox(99, 99, 1, 1),
        ];
        for input in cases {
            let fitted = fit_box(&input, 100, 100).unwrap();
            assert!(fitted.x >= 0 && fitted.y >= 0, "origin clamped: {:?}", fitted);
            assert!(fitted.width >= 1 && fitted.height >= 1);
            assert!(
                fitted.x + fitted.width <= 100 && fitted.y + fitted.height <= 100,
                "box inside image: {:?}",
                fitted
            );
        }
    }

    #[test]
    fn compose_canvas_spans_both_images() {
        let left = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 10, image::Rgb([255, 0, 0])));
        let right = DynamicImage::ImageRgb8(RgbImage::from_pixel(6, 3, image::Rgb([0, 255, 0])));
        let canvas = compose_side_by_side(&left, &right);
        assert_eq!(canvas.dimensions(), (10, 10));
        // Left image at the origin, right image starting at x = left width.
        assert_eq!(canvas.to_rgb8().get_pixel(0, 0), &image::Rgb([255, 0, 0]));
        assert_eq!(canvas.to_rgb8().get_pixel(4, 0), &image::Rgb([0, 255, 0]));
        // Area below the shorter image stays black.
        assert_eq!(canvas.to_rgb8().get_pixel(4, 5), &image::Rgb([0, 0, 0]));
    }
}
