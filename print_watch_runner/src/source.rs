// THEORY:
// A directory of still images stands in for the camera. Files are replayed in
// file-name order and stamped at a fixed frame rate, so a replay gives the same
// motion timings every run. A file that cannot be decoded ends the session as a
// source failure.

use print_watch::{Frame, FrameSource, SetupError, SourceError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Frames in file-name order, stamped `1 / fps` seconds apart from a common origin.
pub struct DirectorySource {
    paths: VecDeque<PathBuf>,
    origin: Instant,
    fps: f64,
    index: u64,
}

impl DirectorySource {
    pub fn open(dir: &Path, fps: f64) -> Result<Self, SetupError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(SetupError::SourceUnavailable(format!("fps must be positive, got {fps}")));
        }
        let entries =
            std::fs::read_dir(dir).map_err(|e| SetupError::SourceUnavailable(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| is_frame(path))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(SetupError::SourceUnavailable(format!("no frames in {}", dir.display())));
        }
        info!(frames = paths.len(), fps, dir = %dir.display(), "frame directory opened");

        Ok(Self {
            paths: paths.into(),
            origin: Instant::now(),
            fps,
            index: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.paths.len()
    }
}

fn is_frame(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        let image = image::open(&path)
            .map_err(|e| SourceError::new(format!("{}: {e}", path.display())))?
            .to_rgb8();

        let timestamp = self.origin + Duration::from_secs_f64(self.index as f64 / self.fps);
        self.index += 1;
        debug!(path = %path.display(), "frame loaded");
        Ok(Some(Frame::new(image, timestamp)))
    }
}
