//! Mapping between displayed (viewport) space and natural (pixel) space.
//!
//! All arithmetic stays in `f64`. The only conversion to integers is
//! [`PixelRect::from_bounds`], called once where a raster operation needs
//! pixel offsets.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::region::{BoundingBox, Point, Region};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
}

impl Dimensions {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for Dimensions {
    fn from((width, height): (u32, u32)) -> Self {
        Self::new(width as f64, height as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub sx: f64,
    pub sy: f64,
}

impl ScaleFactors {
    pub fn between(displayed: Dimensions, natural: Dimensions) -> Result<Self> {
        scale_factors(displayed.width, displayed.height, natural.width, natural.height)
    }

    pub fn inverse(&self) -> Result<Self> {
        if self.sx == 0.0 || self.sy == 0.0 {
            return Err(PipelineError::Geometry(format!(
                "scale factors ({}, {}) have no inverse",
                self.sx, self.sy
            )));
        }
        Ok(Self {
            sx: 1.0 / self.sx,
            sy: 1.0 / self.sy,
        })
    }
}

pub fn scale_factors(
    displayed_width: f64,
    displayed_height: f64,
    natural_width: f64,
    natural_height: f64,
) -> Result<ScaleFactors> {
    if displayed_width == 0.0 || displayed_height == 0.0 {
        return Err(PipelineError::Geometry(format!(
            "displayed size {}x{} has a zero dimension",
            displayed_width, displayed_height
        )));
    }
    let all = [
        displayed_width,
        displayed_height,
        natural_width,
        natural_height,
    ];
    if all.iter().any(|value| !value.is_finite() || *value < 0.0) {
        return Err(PipelineError::Geometry(format!(
            "invalid sizes: displayed {}x{}, natural {}x{}",
            displayed_width, displayed_height, natural_width, natural_height
        )));
    }
    Ok(ScaleFactors {
        sx: natural_width / displayed_width,
        sy: natural_height / displayed_height,
    })
}

pub fn scale_rect(rect: &BoundingBox, factors: ScaleFactors) -> BoundingBox {
    BoundingBox::new(
        rect.x * factors.sx,
        rect.y * factors.sy,
        rect.width * factors.sx,
        rect.height * factors.sy,
    )
}

pub fn scale_point(point: &Point, factors: ScaleFactors) -> Point {
    Point::new(point.x * factors.sx, point.y * factors.sy)
}

pub fn scale_dimensions(dimensions: &Dimensions, factors: ScaleFactors) -> Dimensions {
    Dimensions::new(dimensions.width * factors.sx, dimensions.height * factors.sy)
}

pub fn scale_region(region: &Region, factors: ScaleFactors) -> Region {
    match region {
        Region::Rectangle { bounds } => Region::Rectangle {
            bounds: scale_rect(bounds, factors),
        },
        Region::Polygon { bounds, points } => Region::Polygon {
            bounds: scale_rect(bounds, factors),
            points: points
                .iter()
                .map(|point| scale_point(point, factors))
                .collect(),
        },
        Region::Oval { bounds } => Region::Oval {
            bounds: scale_rect(bounds, factors),
        },
    }
}

pub fn to_natural(
    rect: &BoundingBox,
    displayed: Dimensions,
    natural: Dimensions,
) -> Result<BoundingBox> {
    let factors = ScaleFactors::between(displayed, natural)?;
    Ok(scale_rect(rect, factors))
}

pub fn region_to_natural(
    region: &Region,
    displayed: Dimensions,
    natural: Dimensions,
) -> Result<Region> {
    let factors = ScaleFactors::between(displayed, natural)?;
    Ok(scale_region(region, factors))
}

pub fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

/// Integer placement handed to raster operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn from_bounds(bounds: &BoundingBox) -> Self {
        Self {
            x: round_half_up(bounds.x),
            y: round_half_up(bounds.y),
            width: round_half_up(bounds.width).max(0) as u32,
            height: round_half_up(bounds.height).max(0) as u32,
        }
    }

    /// Intersection with an image of the given size as `(x, y, w, h)`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x.clamp(0, width as i64);
        let y1 = self.y.clamp(0, height as i64);
        let x2 = (self.x + self.width as i64).clamp(0, width as i64);
        let y2 = (self.y + self.height as i64).clamp(0, height as i64);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: &BoundingBox, b: &BoundingBox) -> bool {
        let eps = 1e-9;
        (a.x - b.x).abs() < eps
            && (a.y - b.y).abs() < eps
            && (a.width - b.width).abs() < eps
            && (a.height - b.height).abs() < eps
    }

    #[test]
    fn displayed_rect_maps_to_natural() {
        let rect = BoundingBox::new(10.0, 10.0, 100.0, 50.0);
        let natural = to_natural(
            &rect,
            Dimensions::new(500.0, 250.0),
            Dimensions::new(1000.0, 500.0),
        )
        .expect("to natural");
        assert_eq!(natural, BoundingBox::new(20.0, 20.0, 200.0, 100.0));
    }

    #[test]
    fn zero_displayed_dimension_is_geometry_error() {
        for (w, h) in [(0.0, 250.0), (500.0, 0.0), (0.0, 0.0)] {
            let err = scale_factors(w, h, 1000.0, 500.0).expect_err("zero dimension");
            assert!(matches!(err, PipelineError::Geometry(_)));
        }
    }

    #[test]
    fn axes_scale_independently() {
        let factors = scale_factors(400.0, 300.0, 1200.0, 600.0).expect("factors");
        assert_eq!(factors, ScaleFactors { sx: 3.0, sy: 2.0 });
        assert_eq!(
            scale_point(&Point::new(10.0, 10.0), factors),
            Point::new(30.0, 20.0)
        );
        assert_eq!(
            scale_dimensions(&Dimensions::new(4.0, 4.0), factors),
            Dimensions::new(12.0, 8.0)
        );
    }

    #[test]
    fn scale_rect_round_trips_through_inverse() {
        let rects = [
            BoundingBox::new(10.0, 10.0, 100.0, 50.0),
            BoundingBox::new(0.3, 17.7, 3.1, 99.9),
            BoundingBox::new(123.456, 0.0, 0.001, 5000.0),
        ];
        let factors = [
            ScaleFactors { sx: 2.0, sy: 2.0 },
            ScaleFactors { sx: 1.37, sy: 0.61 },
            ScaleFactors { sx: 3.0, sy: 1.0 / 3.0 },
        ];
        for rect in rects {
            for factor in factors {
                let inverse = factor.inverse().expect("inverse");
                let back = scale_rect(&scale_rect(&rect, factor), inverse);
                assert!(approx(&back, &rect), "{:?} -> {:?}", rect, back);
            }
        }
    }

    #[test]
    fn region_scaling_moves_polygon_vertices() {
        let region = Region::polygon(vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(5.0, 10.0),
        ])
        .expect("polygon");
        let scaled = region_to_natural(
            &region,
            Dimensions::new(100.0, 100.0),
            Dimensions::new(200.0, 300.0),
        )
        .expect("scale");
        assert_eq!(scaled.bounds(), BoundingBox::new(0.0, 0.0, 20.0, 30.0));
        assert_eq!(
            scaled.outline(0).expect("outline")[2],
            Point::new(10.0, 30.0)
        );
    }

    #[test]
    fn pixel_rect_rounds_half_up_once() {
        let rect = PixelRect::from_bounds(&BoundingBox::new(49.5, 50.49, 80.5, 39.5));
        assert_eq!(
            rect,
            PixelRect {
                x: 50,
                y: 50,
                width: 81,
                height: 40
            }
        );
        assert_eq!(round_half_up(-0.5), 0);
        assert_eq!(round_half_up(-1.6), -2);
    }

    #[test]
    fn pixel_rect_clamps_to_image() {
        let rect = PixelRect {
            x: -5,
            y: 90,
            width: 20,
            height: 20,
        };
        assert_eq!(rect.clamp_to(100, 100), Some((0, 90, 15, 10)));
        let outside = PixelRect {
            x: 200,
            y: 0,
            width: 5,
            height: 5,
        };
        assert_eq!(outside.clamp_to(100, 100), None);
    }
}
