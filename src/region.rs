use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{PipelineError, Result};

pub const DEFAULT_OUTLINE_POINTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut x1, mut y1, mut x2, mut y2) = (first.x, first.y, first.x, first.y);
        for point in &points[1..] {
            x1 = x1.min(point.x);
            y1 = y1.min(point.y);
            x2 = x2.max(point.x);
            y2 = y2.max(point.y);
        }
        Some(Self::new(x1, y1, x2 - x1, y2 - y1))
    }

    fn contains_with_tolerance(&self, point: &Point, tolerance: f64) -> bool {
        point.x >= self.x - tolerance
            && point.x <= self.right() + tolerance
            && point.y >= self.y - tolerance
            && point.y <= self.bottom() + tolerance
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

/// A user-drawn shape. Every coordinate of one region lives in the same
/// space; oval outlines are derived on demand and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum Region {
    Rectangle {
        bounds: BoundingBox,
    },
    Polygon {
        bounds: BoundingBox,
        points: Vec<Point>,
    },
    Oval {
        bounds: BoundingBox,
    },
}

impl Region {
    pub fn rectangle(bounds: BoundingBox) -> Self {
        Region::Rectangle { bounds }
    }

    pub fn oval(bounds: BoundingBox) -> Self {
        Region::Oval { bounds }
    }

    /// Polygon whose bounds are derived from its vertices.
    pub fn polygon(points: Vec<Point>) -> Result<Self> {
        let bounds = BoundingBox::from_points(&points)
            .ok_or_else(|| PipelineError::Geometry("polygon has no vertices".to_string()))?;
        Self::polygon_with_bounds(bounds, points)
    }

    pub fn polygon_with_bounds(bounds: BoundingBox, points: Vec<Point>) -> Result<Self> {
        let region = Region::Polygon { bounds, points };
        region.validate()?;
        Ok(region)
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Region::Rectangle { .. } => "rectangle",
            Region::Polygon { .. } => "polygon",
            Region::Oval { .. } => "oval",
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        match self {
            Region::Rectangle { bounds } | Region::Polygon { bounds, .. } | Region::Oval { bounds } => {
                *bounds
            }
        }
    }

    pub fn is_rectangular(&self) -> bool {
        matches!(self, Region::Rectangle { .. })
    }

    /// Vertex outline of the region, `None` for rectangles.
    ///
    /// Ovals yield `points` samples of the inscribed ellipse starting at
    /// angle zero; the sequence is identical for identical input.
    pub fn outline(&self, points: usize) -> Option<Vec<Point>> {
        match self {
            Region::Rectangle { .. } => None,
            Region::Polygon { points: stored, .. } => Some(stored.clone()),
            Region::Oval { bounds } => Some(oval_outline(bounds, points)),
        }
    }

    /// Outline expressed relative to the bounding box origin, which is the
    /// top-left of a crop captured from these bounds.
    pub fn relative_outline(&self, points: usize) -> Option<Vec<Point>> {
        let origin = self.bounds().origin();
        self.outline(points).map(|outline| {
            outline
                .into_iter()
                .map(|point| Point::new(point.x - origin.x, point.y - origin.y))
                .collect()
        })
    }

    /// Checks data that may have arrived through deserialization.
    pub fn validate(&self) -> Result<()> {
        let bounds = self.bounds();
        if !bounds.is_finite() {
            return Err(PipelineError::Geometry(format!(
                "{} bounds are not finite",
                self.shape()
            )));
        }
        if bounds.width < 0.0 || bounds.height < 0.0 {
            return Err(PipelineError::Geometry(format!(
                "{} bounds have negative size ({}x{})",
                self.shape(),
                bounds.width,
                bounds.height
            )));
        }
        if let Region::Polygon { points, .. } = self {
            if points.len() < 3 {
                return Err(PipelineError::Geometry(format!(
                    "polygon needs at least 3 vertices, got {}",
                    points.len()
                )));
            }
            let tolerance = (bounds.width.max(bounds.height) * 0.01).max(1.0);
            if let Some(outside) = points
                .iter()
                .find(|point| !bounds.contains_with_tolerance(point, tolerance))
            {
                return Err(PipelineError::Geometry(format!(
                    "polygon vertex ({}, {}) lies outside its bounds",
                    outside.x, outside.y
                )));
            }
        }
        Ok(())
    }
}

pub fn oval_outline(bounds: &BoundingBox, points: usize) -> Vec<Point> {
    let center = bounds.center();
    let rx = bounds.width / 2.0;
    let ry = bounds.height / 2.0;
    (0..points)
        .map(|i| {
            let theta = 2.0 * PI * i as f64 / points as f64;
            Point::new(center.x + rx * theta.cos(), center.y + ry * theta.sin())
        })
        .collect()
}
