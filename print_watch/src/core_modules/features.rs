// THEORY:
// The `features` module gives the quality scorer its "eyes": a way to describe
// distinctive points of an image so they can be recognised again in a later
// frame, even if the part has shifted, rotated slightly, or is seen at a
// different scale.
//
// Pipeline, per pyramid level:
// 1.  **Detection**: FAST-9 corners, thinned with a greedy non-maximum
//     suppression so neighbouring pixels of one corner do not become separate
//     keypoints with near-identical descriptors.
// 2.  **Orientation**: the intensity centroid of a circular patch around the
//     corner gives a dominant angle.
// 3.  **Description**: a 256-bit binary descriptor built from intensity
//     comparisons of point pairs on a smoothed image. The pairs are rotated by
//     the keypoint angle ("steered"), which makes the descriptor rotation-aware.
// The pyramid (each level 1/1.5 the size of the previous one) supplies scale
// tolerance. Matching uses Hamming distance and a brute-force 2-nearest-neighbour
// search, leaving the ratio test to the caller.

use image::GrayImage;
use image::imageops::{self, FilterType};
use imageproc::corners::{Corner, corners_fast9};
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::OnceLock;

const DESCRIPTOR_BYTES: usize = 32;
const DESCRIPTOR_BITS: usize = DESCRIPTOR_BYTES * 8;
const PATTERN_RADIUS: i32 = 12;
const ORIENTATION_RADIUS: i32 = 15;
/// Keypoints closer than this to any edge cannot be described.
const BORDER: u32 = 18;
const SUPPRESSION_RADIUS: u32 = 3;
const PYRAMID_SCALE: f32 = 1.5;
const SMOOTHING_SIGMA: f32 = 2.0;
const PATTERN_SEED: u64 = 0x5EED_0F_B21E_F000;

static SAMPLING_PATTERN: OnceLock<Vec<[(i32, i32); 2]>> = OnceLock::new();

/// Point pairs compared by every descriptor bit. Fixed for the process lifetime
/// so descriptors from different frames are comparable.
fn sampling_pattern() -> &'static [[(i32, i32); 2]] {
    SAMPLING_PATTERN.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let point = |rng: &mut StdRng| {
            (
                rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
                rng.random_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
            )
        };
        (0..DESCRIPTOR_BITS)
            .map(|_| [point(&mut rng), point(&mut rng)])
            .collect()
    })
}

/// A distinctive location in level-0 image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Dominant orientation in radians.
    pub angle: f32,
    /// Pyramid level the keypoint was found on.
    pub level: u8,
    pub score: f32,
}

/// A 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints and their descriptors; `descriptors[i]` describes `keypoints[i]`.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Anything that can find and describe keypoints in a grayscale image.
pub trait FeatureExtractor: Send {
    fn detect_and_compute(&self, image: &GrayImage) -> Features;
}

/// The default extractor: oriented binary descriptors over FAST corners.
#[derive(Debug, Clone)]
pub struct OrientedBrief {
    pub max_features: usize,
    pub fast_threshold: u8,
    pub levels: u8,
}

impl Default for OrientedBrief {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            levels: 3,
        }
    }
}

impl OrientedBrief {
    pub fn new(max_features: usize) -> Self {
        Self {
            max_features,
            ..Self::default()
        }
    }

    fn describe_level(&self, level_image: &GrayImage, level: u8, scale: f32) -> Vec<(Keypoint, Descriptor)> {
        let (width, height) = level_image.dimensions();
        if width <= 2 * BORDER || height <= 2 * BORDER {
            return Vec::new();
        }

        let mut corners: Vec<Corner> = corners_fast9(level_image, self.fast_threshold)
            .into_iter()
            .filter(|c| c.x >= BORDER && c.y >= BORDER && c.x < width - BORDER && c.y < height - BORDER)
            .collect();
        corners.sort_by(|a, b| b.score.total_cmp(&a.score));
        let corners = suppress_neighbours(corners, width, height);

        let smoothed = gaussian_blur_f32(level_image, SMOOTHING_SIGMA);
        corners
            .into_iter()
            .map(|corner| {
                let angle = intensity_centroid_angle(level_image, corner.x, corner.y);
                let descriptor = steered_descriptor(&smoothed, corner.x, corner.y, angle);
                let keypoint = Keypoint {
                    x: corner.x as f32 * scale,
                    y: corner.y as f32 * scale,
                    angle,
                    level,
                    score: corner.score,
                };
                (keypoint, descriptor)
            })
            .collect()
    }
}

impl FeatureExtractor for OrientedBrief {
    fn detect_and_compute(&self, image: &GrayImage) -> Features {
        let mut found = Vec::new();
        let mut level_image = image.clone();
        let mut scale = 1.0f32;

        for level in 0..self.levels.max(1) {
            if level > 0 {
                let width = (level_image.width() as f32 / PYRAMID_SCALE) as u32;
                let height = (level_image.height() as f32 / PYRAMID_SCALE) as u32;
                if width <= 2 * BORDER || height <= 2 * BORDER {
                    break;
                }
                level_image = imageops::resize(&level_image, width, height, FilterType::Triangle);
                scale *= PYRAMID_SCALE;
            }
            found.extend(self.describe_level(&level_image, level, scale));
        }

        found.sort_by(|a, b| b.0.score.total_cmp(&a.0.score));
        found.truncate(self.max_features);

        let (keypoints, descriptors) = found.into_iter().unzip();
        Features {
            keypoints,
            descriptors,
        }
    }
}

/// Greedy suppression: keeps the strongest corner in every neighbourhood.
/// `corners` must be sorted by descending score.
fn suppress_neighbours(corners: Vec<Corner>, width: u32, height: u32) -> Vec<Corner> {
    let mut taken = vec![false; (width * height) as usize];
    let mut kept = Vec::new();
    for corner in corners {
        if taken[(corner.y * width + corner.x) as usize] {
            continue;
        }
        let x0 = corner.x.saturating_sub(SUPPRESSION_RADIUS);
        let y0 = corner.y.saturating_sub(SUPPRESSION_RADIUS);
        let x1 = (corner.x + SUPPRESSION_RADIUS).min(width - 1);
        let y1 = (corner.y + SUPPRESSION_RADIUS).min(height - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                taken[(y * width + x) as usize] = true;
            }
        }
        kept.push(corner);
    }
    kept
}

fn intensity_centroid_angle(image: &GrayImage, cx: u32, cy: u32) -> f32 {
    let (mut m10, mut m01) = (0.0f32, 0.0f32);
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let value = image.get_pixel((cx as i32 + dx) as u32, (cy as i32 + dy) as u32)[0] as f32;
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

fn steered_descriptor(smoothed: &GrayImage, cx: u32, cy: u32, angle: f32) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |(px, py): (i32, i32)| {
        let rx = (cos * px as f32 - sin * py as f32).round() as i32;
        let ry = (sin * px as f32 + cos * py as f32).round() as i32;
        smoothed.get_pixel((cx as i32 + rx) as u32, (cy as i32 + ry) as u32)[0]
    };

    let mut bits = [0u8; DESCRIPTOR_BYTES];
    for (i, [a, b]) in sampling_pattern().iter().enumerate() {
        if sample(*a) < sample(*b) {
            bits[i / 8] |= 1 << (i % 8);
        }
    }
    Descriptor(bits)
}

/// One query descriptor matched against a train set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorMatch {
    pub query_index: usize,
    pub train_index: usize,
    pub distance: u32,
}

/// The two nearest train descriptors for one query descriptor.
/// `second` is `None` when the train set holds fewer than two descriptors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighbourPair {
    pub best: DescriptorMatch,
    pub second: Option<DescriptorMatch>,
}

/// Brute-force 2-nearest-neighbour search, one entry per query descriptor.
/// Returns an empty list when `train` is empty.
pub fn knn2_match(query: &[Descriptor], train: &[Descriptor]) -> Vec<NeighbourPair> {
    if train.is_empty() {
        return Vec::new();
    }
    query
        .iter()
        .enumerate()
        .map(|(query_index, q)| {
            let mut best: Option<DescriptorMatch> = None;
            let mut second: Option<DescriptorMatch> = None;
            for (train_index, t) in train.iter().enumerate() {
                let candidate = DescriptorMatch {
                    query_index,
                    train_index,
                    distance: q.hamming(t),
                };
                match best {
                    Some(b) if candidate.distance >= b.distance => {
                        if second.is_none_or(|s| candidate.distance < s.distance) {
                            second = Some(candidate);
                        }
                    }
                    _ => {
                        second = best;
                        best = Some(candidate);
                    }
                }
            }
            NeighbourPair {
                // `train` is non-empty, so at least one candidate was seen.
                best: best.unwrap_or(DescriptorMatch {
                    query_index,
                    train_index: 0,
                    distance: u32::MAX,
                }),
                second,
            }
        })
        .collect()
}
