// THEORY:
// The `QualityScorer` estimates how closely the current view of the build plate
// still resembles a known-good reference. It blends two independent cues:
//
// 1.  **Match ratio**: the share of reference keypoints that find an unambiguous
//     partner in the current frame. A partner is accepted only when its distance
//     is below `ratio_test` times the distance of the runner-up (the classic
//     ratio test), which rejects repetitive-texture false matches.
// 2.  **Anomaly ratio**: the share of the frame covered by bright, blob-shaped
//     regions after thresholding and morphological cleaning. Spaghetti, blobs of
//     filament, and detached parts show up here.
//
// coefficient = match_ratio × (1 − anomaly_ratio), clamped to [0, 1].
//
// The scorer can pause itself: once the anomaly ratio falls below the configured
// error threshold it announces the pause and returns 0.0 for every later call
// until `resume` is called. This is a heuristic, not a calibrated measurement.

use crate::core_modules::event_bus::EventBus;
use crate::core_modules::features::{FeatureExtractor, Features, OrientedBrief, knn2_match};
use crate::core_modules::frame::Frame;
use crate::core_modules::morphology::{Kernel, binary_threshold, contour_area, denoise, external_contours};
use crate::config::WatchConfig;
use crate::error::{ScoringError, SetupError};
use image::GrayImage;
use std::path::Path;
use tracing::{debug, info, warn};

/// The known-good view, described once and reused for every frame.
pub struct ReferenceImage {
    gray: GrayImage,
    features: Features,
}

impl ReferenceImage {
    pub fn new(gray: GrayImage, extractor: &dyn FeatureExtractor) -> Self {
        let features = extractor.detect_and_compute(&gray);
        debug!(keypoints = features.keypoints.len(), "reference image described");
        Self { gray, features }
    }

    /// Loads and describes a reference image from disk.
    pub fn load(path: &Path, extractor: &dyn FeatureExtractor) -> Result<Self, SetupError> {
        let image = image::open(path)
            .map_err(|e| SetupError::ReferenceUnavailable(format!("{}: {e}", path.display())))?;
        Ok(Self::new(image.to_luma8(), extractor))
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn features(&self) -> &Features {
        &self.features
    }
}

/// Anything that can rate a frame against a reference image.
pub trait SimilarityScorer: Send {
    fn score(&mut self, reference: &ReferenceImage, frame: &Frame) -> Result<f64, ScoringError>;

    /// Routes the scorer's own announcements to `bus`.
    fn set_event_bus(&mut self, bus: EventBus);

    fn resume(&mut self);
}

pub struct QualityScorer {
    extractor: Box<dyn FeatureExtractor>,
    error_threshold: f64,
    binary_level: u8,
    ratio_test: f64,
    paused: bool,
    bus: EventBus,
}

impl QualityScorer {
    pub fn new(extractor: Box<dyn FeatureExtractor>, error_threshold: f64) -> Self {
        let defaults = WatchConfig::default();
        Self {
            extractor,
            error_threshold,
            binary_level: defaults.anomaly_binary_threshold,
            ratio_test: defaults.ratio_test,
            paused: false,
            bus: EventBus::new(),
        }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            binary_level: config.anomaly_binary_threshold,
            ratio_test: config.ratio_test,
            ..Self::new(Box::new(OrientedBrief::new(config.max_features)), config.error_threshold)
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn describe_reference(&self, gray: GrayImage) -> ReferenceImage {
        ReferenceImage::new(gray, self.extractor.as_ref())
    }

    /// Share of the frame covered by bright blob-shaped regions, in [0, 1].
    pub fn anomaly_ratio(&self, frame: &Frame) -> f64 {
        self.anomaly_ratio_of(&frame.to_gray())
    }

    fn anomaly_ratio_of(&self, gray: &GrayImage) -> f64 {
        let total_area = gray.width() as f64 * gray.height() as f64;
        if total_area == 0.0 {
            return 0.0;
        }
        let mask = denoise(&binary_threshold(gray, self.binary_level), Kernel::Square);
        let anomaly_area: f64 = external_contours(&mask)
            .iter()
            .map(|c| contour_area(&c.points))
            .sum();
        (anomaly_area / total_area).clamp(0.0, 1.0)
    }
}

impl SimilarityScorer for QualityScorer {
    /// Similarity of `frame` to `reference` in [0, 1].
    ///
    /// Returns 0.0 while paused or when either image has no descriptors. Fails
    /// when a reference descriptor cannot be paired with two neighbours.
    fn score(&mut self, reference: &ReferenceImage, frame: &Frame) -> Result<f64, ScoringError> {
        if self.paused {
            return Ok(0.0);
        }

        let gray = frame.to_gray();
        let current = self.extractor.detect_and_compute(&gray);
        if reference.features.is_empty() || current.is_empty() {
            debug!(
                reference = reference.features.descriptors.len(),
                current = current.descriptors.len(),
                "no descriptors to compare"
            );
            return Ok(0.0);
        }

        let mut good_matches = 0usize;
        for pair in knn2_match(&reference.features.descriptors, &current.descriptors) {
            let Some(second) = pair.second else {
                return Err(ScoringError::InsufficientNeighbours {
                    query_index: pair.best.query_index,
                });
            };
            if (pair.best.distance as f64) < self.ratio_test * second.distance as f64 {
                good_matches += 1;
            }
        }

        let reference_keypoints = reference.features.keypoints.len();
        let match_ratio = if reference_keypoints > 0 {
            good_matches as f64 / reference_keypoints as f64
        } else {
            0.0
        };

        let anomaly_ratio = self.anomaly_ratio_of(&gray);
        if anomaly_ratio < self.error_threshold {
            self.paused = true;
            warn!(anomaly_ratio, "print anomaly detected, scoring paused");
            self.bus
                .notify(&format!("print anomaly detected: {anomaly_ratio:.2}, processing paused"));
        }

        let coefficient = (match_ratio * (1.0 - anomaly_ratio)).clamp(0.0, 1.0);
        debug!(good_matches, match_ratio, anomaly_ratio, coefficient, "frame scored");
        Ok(coefficient)
    }

    fn set_event_bus(&mut self, bus: EventBus) {
        self.bus = bus;
    }

    fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            info!("scoring resumed");
            self.bus.notify("processing resumed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::features::{Descriptor, Keypoint};
    use crate::core_modules::test_support::Recorder;
    use image::{Rgb, RgbImage};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Instant;

    /// Returns preset features keyed by the gray value of the top-left pixel.
    struct MarkerExtractor(HashMap<u8, Vec<Descriptor>>);

    impl FeatureExtractor for MarkerExtractor {
        fn detect_and_compute(&self, image: &GrayImage) -> Features {
            let marker = image.get_pixel(0, 0)[0];
            let descriptors = self.0.get(&marker).cloned().unwrap_or_default();
            let keypoints = descriptors
                .iter()
                .enumerate()
                .map(|(i, _)| Keypoint {
                    x: i as f32,
                    y: 0.0,
                    angle: 0.0,
                    level: 0,
                    score: 1.0,
                })
                .collect();
            Features { keypoints, descriptors }
        }
    }

    const A: Descriptor = Descriptor([0x00; 32]);
    const B: Descriptor = Descriptor([0xFF; 32]);
    const C: Descriptor = Descriptor([0x0F; 32]);

    fn near_a() -> Descriptor {
        let mut raw = [0u8; 32];
        raw[0] = 1;
        Descriptor(raw)
    }

    fn marked_frame(marker: u8) -> Frame {
        let image = RgbImage::from_fn(100, 100, |x, y| {
            if x == 0 && y == 0 {
                Rgb([marker, marker, marker])
            } else {
                Rgb([20, 20, 20])
            }
        });
        Frame::new(image, Instant::now())
    }

    fn scorer(table: &[(u8, Vec<Descriptor>)], error_threshold: f64) -> QualityScorer {
        QualityScorer::new(Box::new(MarkerExtractor(table.iter().cloned().collect())), error_threshold)
    }

    fn reference_for(scorer: &QualityScorer, marker: u8) -> ReferenceImage {
        scorer.describe_reference(marked_frame(marker).to_gray())
    }

    #[test]
    fn unambiguous_matches_give_full_similarity() {
        let mut scorer = scorer(&[(1, vec![A, B]), (2, vec![A, B, C])], 0.0);
        let reference = reference_for(&scorer, 1);

        let coefficient = scorer.score(&reference, &marked_frame(2)).unwrap();
        assert!((coefficient - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ambiguous_matches_are_rejected_by_the_ratio_test() {
        let mut scorer = scorer(&[(1, vec![A, B]), (2, vec![A, near_a()])], 0.0);
        let reference = reference_for(&scorer, 1);

        let coefficient = scorer.score(&reference, &marked_frame(2)).unwrap();
        assert!((coefficient - 0.5).abs() < 1e-9);
    }

    #[test]
    fn missing_descriptors_score_zero() {
        let mut scorer = scorer(&[(1, vec![A, B]), (3, vec![])], 0.0);
        let reference = reference_for(&scorer, 1);
        assert_eq!(scorer.score(&reference, &marked_frame(3)).unwrap(), 0.0);

        let empty_reference = reference_for(&scorer, 3);
        assert_eq!(scorer.score(&empty_reference, &marked_frame(1)).unwrap(), 0.0);
    }

    #[test]
    fn single_neighbour_is_a_hard_failure() {
        let mut scorer = scorer(&[(1, vec![A, B]), (2, vec![A])], 0.0);
        let reference = reference_for(&scorer, 1);

        let err = scorer.score(&reference, &marked_frame(2)).unwrap_err();
        assert!(matches!(err, ScoringError::InsufficientNeighbours { query_index: 0 }));
    }

    #[test]
    fn anomaly_ratio_measures_bright_regions() {
        let scorer = scorer(&[], 0.0);
        let image = RgbImage::from_fn(100, 100, |x, y| {
            if (20..60).contains(&x) && (20..60).contains(&y) {
                Rgb([250, 250, 250])
            } else {
                Rgb([30, 30, 30])
            }
        });
        let ratio = scorer.anomaly_ratio(&Frame::new(image, Instant::now()));
        assert!((ratio - 0.1521).abs() < 1e-9);

        assert_eq!(scorer.anomaly_ratio(&marked_frame(0)), 0.0);
        assert_eq!(scorer.anomaly_ratio(&Frame::new(RgbImage::new(0, 0), Instant::now())), 0.0);
    }

    #[test]
    fn bright_regions_lower_the_coefficient() {
        let mut scorer = scorer(&[(1, vec![A, B]), (250, vec![A, B, C])], 0.0);
        let reference = reference_for(&scorer, 1);
        // A lone bright marker pixel is removed by the opening; the square is not.
        let image = RgbImage::from_fn(100, 100, |x, y| {
            let in_square = (20..60).contains(&x) && (20..60).contains(&y);
            if in_square || (x == 0 && y == 0) { Rgb([250, 250, 250]) } else { Rgb([30, 30, 30]) }
        });

        let coefficient = scorer.score(&reference, &Frame::new(image, Instant::now())).unwrap();
        assert!((coefficient - (1.0 - 0.1521)).abs() < 1e-9);
    }

    #[test]
    fn pauses_until_resumed() {
        let recorder = Arc::new(Recorder::default());
        let bus = EventBus::new();
        bus.attach(recorder.clone());

        let mut scorer = scorer(&[(1, vec![A, B]), (2, vec![A, B, C])], 0.5);
        scorer.set_event_bus(bus);
        let reference = reference_for(&scorer, 1);

        // The call that trips the pause still reports its own coefficient.
        assert!((scorer.score(&reference, &marked_frame(2)).unwrap() - 1.0).abs() < 1e-9);
        assert!(scorer.is_paused());
        for _ in 0..3 {
            assert_eq!(scorer.score(&reference, &marked_frame(2)).unwrap(), 0.0);
        }

        scorer.resume();
        assert!(!scorer.is_paused());

        let messages = recorder.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("processing paused"));
        assert_eq!(messages[1], "processing resumed");
    }

    #[test]
    fn zero_error_threshold_never_pauses() {
        let mut scorer = scorer(&[(1, vec![A, B]), (2, vec![A, B, C])], 0.0);
        let reference = reference_for(&scorer, 1);
        for _ in 0..3 {
            scorer.score(&reference, &marked_frame(2)).unwrap();
        }
        assert!(!scorer.is_paused());
    }

    #[test]
    fn missing_reference_file_is_a_setup_error() {
        let extractor = OrientedBrief::default();
        let result = ReferenceImage::load(Path::new("/nonexistent/reference.png"), &extractor);
        assert!(matches!(result, Err(SetupError::ReferenceUnavailable(_))));
    }
}
