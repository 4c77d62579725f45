//! Deduplicated screenshot pipeline.
//!
//! Every captured frame is scaled to the canonical console size, numbered,
//! scored against the last kept frame and then (a) written to disk when it
//! differs enough and (b) turned into exactly one encoder directive. Two
//! thresholds trade disk space against video smoothness: frames are kept on
//! disk up to similarity 54 but the encoder already repeats above 50.

use anyhow::{Context, Result};
use image::DynamicImage;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::compare::similarity_score;
use crate::encoder::EncoderFeed;
use crate::frame::{scale_to, Frame};

/// Frames scoring above this against the last kept frame are not written.
pub const DISK_DEDUP_THRESHOLD: u32 = 54;
/// Frames scoring above this make the encoder repeat the previous frame.
pub const ENCODER_REPEAT_THRESHOLD: u32 = 50;

/// Canonical frame size fed to disk and encoder.
const FRAME_WIDTH: u32 = 1024;
const FRAME_HEIGHT: u32 = 768;

const LAST_LINK_NAME: &str = "last.png";

pub struct ScreenshotPipeline {
    dir: PathBuf,
    interval: Duration,
    counter: u64,
    last_frame: Option<Arc<Frame>>,
    encoder: Option<EncoderFeed>,
}

impl ScreenshotPipeline {
    /// Create the pipeline, ensuring the screenshot directory exists.
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create screenshot dir: {}", dir.display()))?;
        info!(path = %dir.display(), "Screenshot pipeline ready");
        Ok(Self {
            dir,
            interval,
            counter: 0,
            last_frame: None,
            encoder: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn set_encoder(&mut self, encoder: EncoderFeed) {
        self.encoder = Some(encoder);
    }

    /// Close the encoder stream, signalling end-of-video.
    pub async fn close_encoder(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            encoder.close().await?;
        }
        Ok(())
    }

    /// The most recently kept frame; skipped frames logically re-use it.
    pub fn last_frame(&self) -> Option<&Arc<Frame>> {
        self.last_frame.as_ref()
    }

    pub fn last_screenshot_name(&self) -> Option<&str> {
        self.last_frame.as_ref().map(|f| f.filename.as_str())
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Run one captured image through scaling, dedup, disk and encoder.
    pub async fn process(&mut self, image: DynamicImage) -> Result<()> {
        let started = Instant::now();
        let image = scale_to(image, FRAME_WIDTH, FRAME_HEIGHT);

        self.counter += 1;
        let seq = self.counter;
        let sim = self
            .last_frame
            .as_deref()
            .map(|last| similarity_score(&last.image, &image))
            .unwrap_or(0);

        if sim <= DISK_DEDUP_THRESHOLD {
            let frame = Arc::new(Frame::new(image, seq));
            frame.write(&self.dir)?;
            self.repoint_last_link(&frame.filename)?;
            debug!(seq, sim, file = %frame.filename, "Frame kept");
            self.last_frame = Some(frame);
        } else {
            debug!(seq, sim, "Frame unchanged, re-using previous file");
        }

        if let Some(encoder) = self.encoder.as_mut() {
            if sim > ENCODER_REPEAT_THRESHOLD {
                encoder.repeat().await?;
            } else {
                // sim <= 50 implies the frame was just kept on disk.
                let name = self
                    .last_frame
                    .as_ref()
                    .map(|f| f.filename.clone())
                    .unwrap_or_default();
                encoder.encode(&name).await?;
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.interval {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "Screenshot handling exceeded the screenshot interval"
            );
        }
        Ok(())
    }

    fn repoint_last_link(&self, filename: &str) -> Result<()> {
        let link = self.dir.join(LAST_LINK_NAME);
        match fs::remove_file(&link) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to unlink {}", link.display()));
            }
        }
        std::os::unix::fs::symlink(filename, &link)
            .with_context(|| format!("Failed to symlink {} -> {}", link.display(), filename))
    }
}
