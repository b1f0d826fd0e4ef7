// THEORY:
// The `BackgroundModel` is the temporal memory of the motion layer: it learns
// what "normal" looks like for every pixel of the scene. Each pixel keeps a
// running mean and variance of its grayscale intensity. A new sample is foreground when its squared distance
// from the mean exceeds `var_threshold` times the learned variance.
//
// The learning rate ramps from 1 down to 1/history, so the first frames build the
// model quickly and afterwards it adapts slowly to lighting drift. Shadows are not
// modelled: every sample is either background or foreground.

use image::{GrayImage, Luma};

const INITIAL_VARIANCE: f32 = 15.0 * 15.0;
const MIN_VARIANCE: f32 = 4.0;
const MAX_VARIANCE: f32 = 75.0 * 75.0;

pub struct BackgroundModel {
    history: u32,
    var_threshold: f32,
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    /// Frames absorbed since the model was (re)initialised, capped at `history`.
    samples: u32,
}

impl BackgroundModel {
    pub fn new(history: u32, var_threshold: f32) -> Self {
        Self {
            history: history.max(1),
            var_threshold,
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            samples: 0,
        }
    }

    /// Classifies every pixel of `gray` and folds the frame into the model.
    /// A frame whose size differs from the model restarts learning.
    pub fn apply(&mut self, gray: &GrayImage) -> GrayImage {
        if gray.width() != self.width || gray.height() != self.height || self.samples == 0 {
            self.reset_to(gray);
            return GrayImage::new(gray.width(), gray.height());
        }

        self.samples = (self.samples + 1).min(self.history);
        let alpha = 1.0 / self.samples as f32;
        let mut mask = GrayImage::new(self.width, self.height);

        for (i, (out, value)) in mask.pixels_mut().zip(gray.pixels()).enumerate() {
            let sample = value[0] as f32;
            let diff = sample - self.mean[i];
            let dist_sq = diff * diff;

            if dist_sq > self.var_threshold * self.variance[i] {
                *out = Luma([255]);
            }

            self.mean[i] += alpha * diff;
            self.variance[i] =
                (self.variance[i] + alpha * (dist_sq - self.variance[i])).clamp(MIN_VARIANCE, MAX_VARIANCE);
        }

        mask
    }

    fn reset_to(&mut self, gray: &GrayImage) {
        self.width = gray.width();
        self.height = gray.height();
        self.mean = gray.pixels().map(|p| p[0] as f32).collect();
        self.variance = vec![INITIAL_VARIANCE; self.mean.len()];
        self.samples = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_is_all_background() {
        let mut model = BackgroundModel::new(500, 16.0);
        let mask = model.apply(&GrayImage::from_pixel(8, 8, Luma([120])));
        assert!(mask.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn static_scene_stays_background() {
        let mut model = BackgroundModel::new(500, 16.0);
        let scene = GrayImage::from_pixel(8, 8, Luma([90]));
        for _ in 0..20 {
            let mask = model.apply(&scene);
            assert!(mask.pixels().all(|p| p[0] == 0));
        }
    }

    #[test]
    fn sudden_change_is_foreground() {
        let mut model = BackgroundModel::new(500, 16.0);
        let scene = GrayImage::from_pixel(8, 8, Luma([30]));
        for _ in 0..10 {
            model.apply(&scene);
        }
        let mut changed = scene.clone();
        changed.put_pixel(3, 3, Luma([250]));
        let mask = model.apply(&changed);

        assert_eq!(mask.get_pixel(3, 3)[0], 255);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn resolution_change_restarts_learning() {
        let mut model = BackgroundModel::new(500, 16.0);
        model.apply(&GrayImage::from_pixel(8, 8, Luma([0])));
        let mask = model.apply(&GrayImage::from_pixel(4, 4, Luma([255])));
        assert_eq!(mask.dimensions(), (4, 4));
        assert!(mask.pixels().all(|p| p[0] == 0));
    }
}
