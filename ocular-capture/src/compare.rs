use image::DynamicImage;
use image_compare::{Algorithm, Metric, Similarity};
use tracing::debug;

/// Score returned for two indistinguishable frames.
pub const SIMILARITY_IDENTICAL: u32 = 10_000;

/// Compare two images using histogram similarity (Hellinger metric).
pub fn compare_histogram(a: &DynamicImage, b: &DynamicImage) -> anyhow::Result<f64> {
    let la = a.to_luma8();
    let lb = b.to_luma8();
    image_compare::gray_similarity_histogram(Metric::Hellinger, &la, &lb)
        .map_err(|e| anyhow::anyhow!("Histogram compare failed: {}", e))
}

/// Compare two images using SSIM (structural similarity).
pub fn compare_ssim(a: &DynamicImage, b: &DynamicImage) -> anyhow::Result<f64> {
    let la = a.to_luma8();
    let lb = b.to_luma8();
    let result: Similarity =
        image_compare::gray_similarity_structure(&Algorithm::MSSIMSimple, &la, &lb)
            .map_err(|e| anyhow::anyhow!("SSIM compare failed: {}", e))?;
    Ok(result.score)
}

/// Combined difference score: average of histogram diff and SSIM diff.
/// Returns a value where 0.0 = identical, higher = more different.
pub fn frame_difference(a: &DynamicImage, b: &DynamicImage) -> anyhow::Result<f64> {
    let resized;
    let b = if a.width() != b.width() || a.height() != b.height() {
        resized = b.resize_exact(a.width(), a.height(), image::imageops::FilterType::Triangle);
        &resized
    } else {
        b
    };
    let histogram_diff = compare_histogram(a, b)?;
    let ssim_diff = 1.0 - compare_ssim(a, b)?;
    Ok((histogram_diff + ssim_diff) / 2.0)
}

/// Map the combined difference onto the engine's 0..=10000 similarity scale.
///
/// Identical frames score [`SIMILARITY_IDENTICAL`]; the mapping is a negative
/// log of the difference so that near-identical frames land well above the
/// dedup thresholds and visually distinct frames land below 30. Comparison
/// failure counts as maximally different.
pub fn similarity_score(a: &DynamicImage, b: &DynamicImage) -> u32 {
    match frame_difference(a, b) {
        Ok(diff) if diff < 1e-6 => SIMILARITY_IDENTICAL,
        Ok(diff) => {
            let score = (-diff.ln() * 30.0).round();
            score.clamp(0.0, SIMILARITY_IDENTICAL as f64) as u32
        }
        Err(e) => {
            debug!("Image comparison failed ({}), treating as fully different", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            image::Rgb([value, value, value]),
        ))
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn identical_frames_score_max() {
        let img = gradient(64, 64);
        assert_eq!(similarity_score(&img, &img), SIMILARITY_IDENTICAL);
    }

    #[test]
    fn opposite_frames_score_low() {
        let black = solid(64, 64, 0);
        let white = solid(64, 64, 255);
        assert!(similarity_score(&black, &white) < 30);
    }

    #[test]
    fn score_is_symmetric() {
        let a = gradient(64, 64);
        let b = solid(64, 64, 40);
        assert_eq!(similarity_score(&a, &b), similarity_score(&b, &a));
    }

    #[test]
    fn closer_frames_score_higher() {
        let a = gradient(64, 64);
        let far = solid(64, 64, 255);
        assert!(similarity_score(&a, &a) > similarity_score(&a, &far));
    }

    #[test]
    fn dimension_mismatch_is_tolerated() {
        let a = gradient(64, 64);
        let b = gradient(32, 32);
        // Must not error out; the smaller frame is rescaled before scoring.
        let _ = similarity_score(&a, &b);
    }
}
