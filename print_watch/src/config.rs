// THEORY:
// One flat struct carries every tunable of the engine, from the motion
// detector's contour area to the JPEG quality of stored frames. Callers build it
// from defaults or deserialise it from any serde source; missing fields fall
// back to their defaults. `validate` rejects values no layer can work with
// before a session is allowed to start.

use crate::error::SetupError;
use serde::Deserialize;

/// Configuration for every layer of the engine. Any field missing from a
/// deserialised source falls back to its default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Smallest contour area (px²) that counts as motion.
    pub min_contour_area: f64,
    /// Time without motion before a burst is considered over.
    pub motion_cooldown_seconds: f64,
    /// Bursts shorter than this are reported as "too short to count" in the logs.
    pub min_motion_duration_seconds: f64,
    /// Coefficients at or below this value are treated as a print defect.
    pub quality_threshold: f64,
    /// The scorer pauses itself once the anomaly ratio drops below this value.
    /// Zero disables the pause.
    pub error_threshold: f64,
    /// Frames of history the background model adapts over.
    pub background_history: u32,
    /// Squared Mahalanobis distance beyond which a pixel is foreground.
    pub background_var_threshold: f32,
    /// Grayscale level above which a pixel counts towards the anomaly area.
    pub anomaly_binary_threshold: u8,
    /// Keypoint budget per image for the quality scorer.
    pub max_features: usize,
    /// Nearest/second-nearest distance ratio for accepting a match.
    pub ratio_test: f64,
    /// JPEG quality used when a frame is attached to a print record.
    pub jpeg_quality: u8,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            min_contour_area: 1000.0,
            motion_cooldown_seconds: 10.0,
            min_motion_duration_seconds: 5.0,
            quality_threshold: 0.01,
            error_threshold: 0.0,
            background_history: 500,
            background_var_threshold: 16.0,
            anomaly_binary_threshold: 200,
            max_features: 500,
            ratio_test: 0.75,
            jpeg_quality: 85,
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<(), SetupError> {
        let non_negative = [
            ("min_contour_area", self.min_contour_area),
            ("motion_cooldown_seconds", self.motion_cooldown_seconds),
            ("min_motion_duration_seconds", self.min_motion_duration_seconds),
            ("quality_threshold", self.quality_threshold),
            ("error_threshold", self.error_threshold),
            ("background_var_threshold", self.background_var_threshold as f64),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SetupError::InvalidConfig(format!("{name} must be a non-negative number, got {value}")));
            }
        }
        if !(self.ratio_test > 0.0 && self.ratio_test <= 1.0) {
            return Err(SetupError::InvalidConfig(format!(
                "ratio_test must be in (0, 1], got {}",
                self.ratio_test
            )));
        }
        if self.background_history == 0 {
            return Err(SetupError::InvalidConfig("background_history must be at least 1".into()));
        }
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(SetupError::InvalidConfig(format!(
                "jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}
