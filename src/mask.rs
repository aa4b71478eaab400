//! Binary inpainting masks: white where the page should be filled.

use image::{DynamicImage, RgbaImage};
use tiny_skia::{Color, FillRule, Paint, PathBuilder, Pixmap, Rect, Transform};

use crate::capture::encode_png;
use crate::error::{PipelineError, Result};
use crate::region::Region;

/// Rasterizes every region into one `width`x`height` grayscale PNG mask.
/// Ovals are filled through their `outline_points`-vertex outline so the
/// mask follows the same shape the patch renderer is given.
pub fn build_mask(width: u32, height: u32, regions: &[Region], outline_points: usize) -> Result<Vec<u8>> {
    let mut pixmap = Pixmap::new(width, height).ok_or_else(|| {
        PipelineError::Geometry(format!("cannot build a {}x{} mask", width, height))
    })?;
    pixmap.fill(Color::BLACK);

    let mut paint = Paint::default();
    paint.set_color(Color::WHITE);
    paint.anti_alias = false;

    for region in regions {
        region.validate()?;
        let mut builder = PathBuilder::new();
        match region.outline(outline_points) {
            None => {
                let bounds = region.bounds();
                let Some(rect) = Rect::from_xywh(
                    bounds.x as f32,
                    bounds.y as f32,
                    bounds.width as f32,
                    bounds.height as f32,
                ) else {
                    continue;
                };
                builder.push_rect(rect);
            }
            Some(points) => {
                let mut points = points.into_iter();
                let Some(first) = points.next() else {
                    continue;
                };
                builder.move_to(first.x as f32, first.y as f32);
                for point in points {
                    builder.line_to(point.x as f32, point.y as f32);
                }
                builder.close();
            }
        }
        // Degenerate shapes (zero area) produce no path.
        if let Some(path) = builder.finish() {
            pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
        }
    }

    let rgba = RgbaImage::from_raw(width, height, pixmap.data().to_vec())
        .ok_or_else(|| PipelineError::Geometry("mask buffer size mismatch".to_string()))?;
    encode_png(&DynamicImage::ImageLuma8(DynamicImage::ImageRgba8(rgba).to_luma8()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{BoundingBox, Point};
    use crate::test_util::pixel_at;

    #[test]
    fn rectangle_is_white_on_black() {
        let regions = [Region::rectangle(BoundingBox::new(10.0, 10.0, 20.0, 10.0))];
        let mask = build_mask(50, 40, &regions, 32).expect("mask");
        assert_eq!(pixel_at(&mask, 15, 15), [255, 255, 255, 255]);
        assert_eq!(pixel_at(&mask, 5, 5), [0, 0, 0, 255]);
        assert_eq!(pixel_at(&mask, 35, 15), [0, 0, 0, 255]);
    }

    #[test]
    fn oval_leaves_corners_unmasked() {
        let regions = [Region::oval(BoundingBox::new(0.0, 0.0, 40.0, 40.0))];
        let mask = build_mask(40, 40, &regions, 32).expect("mask");
        assert_eq!(pixel_at(&mask, 20, 20), [255, 255, 255, 255]);
        assert_eq!(pixel_at(&mask, 1, 1), [0, 0, 0, 255]);
    }

    #[test]
    fn several_regions_share_one_mask() {
        let triangle = Region::polygon(vec![
            Point::new(60.0, 10.0),
            Point::new(90.0, 10.0),
            Point::new(75.0, 40.0),
        ])
        .expect("polygon");
        let regions = [
            Region::rectangle(BoundingBox::new(0.0, 0.0, 20.0, 20.0)),
            triangle,
        ];
        let mask = build_mask(100, 50, &regions, 32).expect("mask");
        assert_eq!(pixel_at(&mask, 10, 10), [255, 255, 255, 255]);
        assert_eq!(pixel_at(&mask, 75, 20), [255, 255, 255, 255]);
        assert_eq!(pixel_at(&mask, 40, 30), [0, 0, 0, 255]);
    }

    #[test]
    fn zero_sized_mask_is_rejected() {
        assert!(build_mask(0, 10, &[], 32).is_err());
    }
}
