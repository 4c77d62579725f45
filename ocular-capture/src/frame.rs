use anyhow::{Context, Result};
use image::DynamicImage;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filename for the frame with the given sequence number.
pub fn shot_filename(seq: u64) -> String {
    format!("shot-{seq:010}.png")
}

/// A captured frame together with its sequence number and on-disk name.
/// Immutable once captured; shared as `Arc<Frame>` between the pipeline and
/// the assertion state.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub seq: u64,
    pub filename: String,
}

impl Frame {
    pub fn new(image: DynamicImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            filename: shot_filename(seq),
        }
    }

    /// Write the frame as PNG under `dir`, returning the full path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(&self.filename);
        let file = fs::File::create(&path)
            .with_context(|| format!("Failed to create screenshot file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        let rgb = self.image.to_rgb8();
        let encoder = image::codecs::png::PngEncoder::new(&mut writer);
        rgb.write_with_encoder(encoder)
            .with_context(|| format!("PNG encoding failed for {}", path.display()))?;

        drop(writer);
        debug!(file = %path.display(), seq = self.seq, "Frame written");
        Ok(path)
    }
}

/// Scale an image to the given dimensions with the Triangle filter.
/// Returns the input untouched when it already matches.
pub fn scale_to(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.width() == width && image.height() == height {
        return image;
    }
    image.resize_exact(width, height, image::imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    fn make_test_image(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn filenames_are_zero_padded() {
        assert_eq!(shot_filename(1), "shot-0000000001.png");
        assert_eq!(shot_filename(1234567890), "shot-1234567890.png");
    }

    #[test]
    fn write_and_reload_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let frame = Frame::new(make_test_image(32, 24), 7);
        let path = frame.write(tmp.path()).unwrap();
        assert!(path.ends_with("shot-0000000007.png"));

        let loaded = image::open(&path).unwrap();
        assert_eq!(loaded.width(), 32);
        assert_eq!(loaded.height(), 24);
    }

    #[test]
    fn scale_resizes_only_when_needed() {
        let img = make_test_image(100, 50);
        let scaled = scale_to(img.clone(), 10, 20);
        assert_eq!((scaled.width(), scaled.height()), (10, 20));

        let untouched = scale_to(img, 100, 50);
        assert_eq!((untouched.width(), untouched.height()), (100, 50));
    }
}
