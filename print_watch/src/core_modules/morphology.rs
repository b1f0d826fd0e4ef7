// THEORY:
// Shared binary-mask utilities for the two mask-driven detectors (motion and
// anomaly). Both follow the same recipe: produce a binary mask, clean it with a
// morphological opening (removes speckle) followed by a closing (fills pinholes),
// then trace the outer borders of the remaining regions and measure them.

use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{close, open};
use imageproc::point::Point;
use imageproc::rect::Rect;
use image::{GrayImage, Luma};

/// Radius of the 5x5 structuring element used for opening and closing.
pub const KERNEL_RADIUS: u8 = 2;

/// Shape of the 5x5 structuring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Every cell of the 5x5 window.
    Square,
    /// The inscribed disk, corners cut off.
    Ellipse,
}

impl Kernel {
    fn norm(self) -> Norm {
        match self {
            Kernel::Square => Norm::LInf,
            Kernel::Ellipse => Norm::L2,
        }
    }
}

/// Pixels strictly brighter than `level` become 255, everything else 0.
pub fn binary_threshold(gray: &GrayImage, level: u8) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > level {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Opening then closing with a 5x5 kernel of the given shape.
pub fn denoise(mask: &GrayImage, kernel: Kernel) -> GrayImage {
    let opened = open(mask, kernel.norm(), KERNEL_RADIUS);
    close(&opened, kernel.norm(), KERNEL_RADIUS)
}

/// Outer borders of top-level foreground regions.
pub fn external_contours(mask: &GrayImage) -> Vec<Contour<i32>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.parent.is_none() && matches!(c.border_type, BorderType::Outer))
        .collect()
}

/// Polygon area enclosed by a traced border (shoelace formula).
pub fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice_area += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    twice_area.abs() as f64 / 2.0
}

/// Axis-aligned box enclosing every border point.
pub fn bounding_rect(points: &[Point<i32>]) -> Option<Rect> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let width = (max_x - min_x + 1) as u32;
    let height = (max_y - min_y + 1) as u32;
    Some(Rect::at(min_x, min_y).of_size(width, height))
}
