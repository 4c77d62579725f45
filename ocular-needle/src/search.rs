use image::DynamicImage;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::needle::Needle;
use ocular_capture::compare::frame_difference;

/// One attempted needle with its achieved match percentage.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateMatch {
    pub name: String,
    pub similarity: f64,
}

/// Result of one search pass over the needle list.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub found: Option<CandidateMatch>,
    pub candidates: Vec<CandidateMatch>,
}

/// Search the frame against the first `ratio` fraction of `needles`.
///
/// `ratio` bounds the cost of one poll: 0.02 tries a token subset (always at
/// least one needle), 1.0 is exhaustive. `threshold` widens each needle's own
/// match level. The best needle reaching its level wins; everything else
/// attempted is reported as a failed candidate.
pub fn search(
    image: &DynamicImage,
    needles: &[Arc<Needle>],
    threshold: f64,
    ratio: f64,
) -> SearchOutcome {
    let mut outcome = SearchOutcome::default();
    if needles.is_empty() {
        return outcome;
    }

    let count = ((needles.len() as f64 * ratio).ceil() as usize).clamp(1, needles.len());
    let mut best: Option<CandidateMatch> = None;

    for needle in &needles[..count] {
        let similarity = match frame_difference(image, &needle.image) {
            Ok(diff) => ((1.0 - diff) * 100.0).clamp(0.0, 100.0),
            Err(e) => {
                debug!(needle = %needle.name, "Needle comparison failed: {}", e);
                0.0
            }
        };
        let candidate = CandidateMatch {
            name: needle.name.clone(),
            similarity,
        };

        if similarity + threshold >= needle.match_level {
            match &best {
                Some(b) if b.similarity >= similarity => outcome.candidates.push(candidate),
                _ => {
                    if let Some(prev) = best.replace(candidate) {
                        outcome.candidates.push(prev);
                    }
                }
            }
        } else {
            outcome.candidates.push(candidate);
        }
    }

    outcome.found = best;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn solid(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(
            32,
            32,
            image::Rgb([value, value, value]),
        ))
    }

    fn needle(name: &str, image: DynamicImage, match_level: f64) -> Arc<Needle> {
        Arc::new(Needle {
            name: name.to_string(),
            tags: vec![name.to_string()],
            match_level,
            image,
        })
    }

    #[test]
    fn empty_list_finds_nothing() {
        let outcome = search(&solid(0), &[], 0.0, 1.0);
        assert!(outcome.found.is_none());
        assert!(outcome.candidates.is_empty());
    }

    #[test]
    fn matching_needle_is_found() {
        let frame = solid(128);
        let needles = vec![
            needle("off", solid(0), 96.0),
            needle("on", frame.clone(), 96.0),
        ];
        let outcome = search(&frame, &needles, 0.0, 1.0);
        assert_eq!(outcome.found.unwrap().name, "on");
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].name, "off");
    }

    #[test]
    fn partial_ratio_tries_at_least_one() {
        let frame = solid(128);
        let needles = vec![
            needle("first", solid(0), 96.0),
            needle("match", frame.clone(), 96.0),
        ];
        let outcome = search(&frame, &needles, 0.0, 0.02);
        // Only the head of the list was attempted.
        assert!(outcome.found.is_none());
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].name, "first");
    }

    #[test]
    fn failed_needles_report_their_score() {
        let frame = solid(255);
        let needles = vec![needle("dark", solid(0), 96.0)];
        let outcome = search(&frame, &needles, 0.0, 1.0);
        assert!(outcome.found.is_none());
        assert!(outcome.candidates[0].similarity < 96.0);
    }
}
