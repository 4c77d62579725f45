//! The assert-screen state machine.
//!
//! At most one assertion is armed per engine. Polls are runner-driven: each
//! `check_asserted_screen` looks at the most recent kept frame, searches a
//! ratio-bounded slice of the armed needles and either reports a match,
//! keeps sampling visually distinct failure frames, or runs the timeout
//! triage (interactive freeze, stall crash, or a summarized failure list).

use ocular_capture::compare::similarity_score;
use ocular_capture::frame::Frame;
use ocular_needle::needle::Needle;
use ocular_needle::search::{search, CandidateMatch};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::control::ControlSignals;

/// Soft cap on accumulated failure frames.
pub const FAILS_SOFT_CAP: usize = 60;
/// Target size after reduction.
pub const FAILS_REDUCED: usize = 20;
/// Failure frames scoring at or above this against the previous kept
/// failure are too similar to keep.
const DISTINCT_FAILURE_THRESHOLD: u32 = 30;
/// Reduction may drop the final mismatch; re-append it unless the new tail
/// already looks the same.
const TAIL_DEDUP_THRESHOLD: u32 = 50;
/// Stored similarity of the timeout sentinel, high enough to always
/// survive reduction.
const SENTINEL_SIMILARITY: u32 = 1000;

const RATIO_FULL: f64 = 1.0;
const RATIO_PARTIAL: f64 = 0.02;

/// A frame that failed to match while an assertion was armed.
#[derive(Clone)]
pub struct FailedMatch {
    pub frame: Arc<Frame>,
    pub candidates: Vec<CandidateMatch>,
    /// Whole seconds left until the deadline when the frame was sampled;
    /// larger means earlier.
    pub time_left: i64,
    pub similarity_to_prev: u32,
    pub filename: String,
}

pub struct AssertionArming {
    pub needles: Vec<Arc<Needle>>,
    pub tags: Vec<String>,
    pub deadline: Instant,
    pub last_check: Option<(String, f64)>,
    pub fails: Vec<FailedMatch>,
    pub stall_detected: bool,
    pub reload_needles: bool,
}

/// What one poll decided; the engine turns this into a wire response and
/// performs the VM freeze / crash-marker side effects.
pub enum PollOutcome {
    Pending,
    Matched(Value),
    TimedOut(Value),
    /// Interactive hold: respond but keep the arming; the engine freezes
    /// the SUT first.
    Waiting(Value),
    /// Stall during an expired assertion; fatal.
    Stalled,
}

#[derive(Default)]
pub struct AssertEngine {
    arming: Option<AssertionArming>,
    interactive: bool,
}

impl AssertEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.arming.is_some()
    }

    pub fn tags(&self) -> Option<&[String]> {
        self.arming.as_ref().map(|a| a.tags.as_slice())
    }

    /// Whether at least one check has run for the current arming.
    pub fn has_checked(&self) -> bool {
        self.arming
            .as_ref()
            .is_some_and(|a| a.last_check.is_some())
    }

    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive;
    }

    pub fn note_stall(&mut self) {
        if let Some(arming) = self.arming.as_mut() {
            if !arming.stall_detected {
                warn!("Stall detected: no fresh screenshot while asserting");
            }
            arming.stall_detected = true;
        }
    }

    /// Arm a new assertion, superseding any previous one.
    pub fn arm(
        &mut self,
        tags: Vec<String>,
        needles: Vec<Arc<Needle>>,
        deadline: Instant,
        reload_needles: bool,
    ) {
        if needles.is_empty() {
            warn!(
                mustmatch = %tags.join("_"),
                "No needles for the requested tags, assertion will time out"
            );
        } else {
            info!(
                mustmatch = %tags.join("_"),
                needles = needles.len(),
                "Asserting screen"
            );
        }
        self.arming = Some(AssertionArming {
            needles,
            tags,
            deadline,
            last_check: None,
            fails: Vec::new(),
            stall_detected: false,
            reload_needles,
        });
    }

    /// Re-arm the current assertion after an interactive hold.
    pub fn retry(
        &mut self,
        deadline: Instant,
        reload_needles: bool,
        needles: Option<Vec<Arc<Needle>>>,
    ) {
        if let Some(arming) = self.arming.as_mut() {
            arming.deadline = deadline;
            arming.last_check = None;
            arming.fails.clear();
            arming.stall_detected = false;
            arming.reload_needles = reload_needles;
            if let Some(needles) = needles {
                arming.needles = needles;
            }
        }
    }

    /// Force the deadline into the past so the next poll reports timeout.
    pub fn expire(&mut self, now: Instant) {
        if let Some(arming) = self.arming.as_mut() {
            arming.deadline = now - Duration::from_secs(1);
        }
    }

    /// Run one check against the most recent kept frame.
    pub fn poll(
        &mut self,
        frame: Option<&Arc<Frame>>,
        now: Instant,
        signals: &ControlSignals,
    ) -> anyhow::Result<PollOutcome> {
        let interactive = self.interactive;
        let Some(arming) = self.arming.as_mut() else {
            return Ok(PollOutcome::Pending);
        };
        let Some(frame) = frame else {
            return Ok(PollOutcome::Pending);
        };

        let n = remaining_secs(arming.deadline, now);
        let ratio = if n < 0 || n % 5 == 0 {
            RATIO_FULL
        } else {
            RATIO_PARTIAL
        };

        // Nothing new since the last attempt and no stronger search wanted.
        if n >= 0 {
            if let Some((last_name, last_ratio)) = &arming.last_check {
                if *last_name == frame.filename && *last_ratio >= ratio {
                    return Ok(PollOutcome::Pending);
                }
            }
        }

        let outcome = search(&frame.image, &arming.needles, 0.0, ratio);
        debug!(
            file = %frame.filename,
            ratio,
            time_left = n,
            candidates = outcome.candidates.len(),
            "Checked asserted screen"
        );

        if interactive && signals.stop_requested() && !arming.reload_needles {
            return Ok(PollOutcome::Waiting(waiting_payload(
                frame,
                &outcome.candidates,
            )));
        }

        if let Some(found) = outcome.found {
            signals.clear_continue()?;
            info!(needle = %found.name, file = %frame.filename, "Needle matched");
            let response = json!({
                "filename": frame.filename,
                "found": found,
                "candidates": outcome.candidates,
            });
            self.arming = None;
            return Ok(PollOutcome::Matched(response));
        }

        if n < 0 {
            if interactive && !signals.continue_present() {
                signals.request_stop()?;
                return Ok(PollOutcome::Waiting(waiting_payload(
                    frame,
                    &outcome.candidates,
                )));
            }
            if arming.stall_detected {
                return Ok(PollOutcome::Stalled);
            }
            arming.fails.push(FailedMatch {
                frame: Arc::clone(frame),
                candidates: outcome.candidates,
                time_left: 0,
                similarity_to_prev: SENTINEL_SIMILARITY,
                filename: frame.filename.clone(),
            });
            let failed_screens = failed_screens_payload(&mut arming.fails);
            info!(screens = failed_screens.len(), "Assert screen timed out");
            self.arming = None;
            return Ok(PollOutcome::TimedOut(json!({
                "timeout": true,
                "failed_screens": failed_screens,
            })));
        }

        if ratio == RATIO_FULL {
            let sim = match arming.fails.last() {
                Some(last) if n > 0 => similarity_score(&last.frame.image, &frame.image),
                _ => 29,
            };
            if sim < DISTINCT_FAILURE_THRESHOLD {
                arming.fails.push(FailedMatch {
                    frame: Arc::clone(frame),
                    candidates: outcome.candidates,
                    time_left: n,
                    similarity_to_prev: sim,
                    filename: frame.filename.clone(),
                });
                if arming.fails.len() > FAILS_SOFT_CAP {
                    reduce_to_biggest_changes(&mut arming.fails, FAILS_REDUCED);
                }
            }
        }

        arming.last_check = Some((frame.filename.clone(), ratio));
        Ok(PollOutcome::Pending)
    }
}

fn waiting_payload(frame: &Arc<Frame>, candidates: &[CandidateMatch]) -> Value {
    json!({
        "waiting_for_needle": true,
        "filename": frame.filename,
        "candidates": candidates,
    })
}

/// Whole seconds until `deadline`; negative once it has passed.
fn remaining_secs(deadline: Instant, now: Instant) -> i64 {
    if now < deadline {
        (deadline - now).as_secs_f64().floor() as i64
    } else {
        -((now - deadline).as_secs_f64().floor() as i64) - 1
    }
}

/// Shrink an overflowing failure list to `limit` + 1 entries.
///
/// The earliest failure is kept unconditionally; from the rest, the entries
/// with the highest stored similarity field survive (the sampler stores low
/// scores for ordinary frames and forces the sentinel high, so this keeps
/// the anchors). The survivors are re-ordered earliest-first and their
/// neighbor similarities recomputed.
pub fn reduce_to_biggest_changes(fails: &mut Vec<FailedMatch>, limit: usize) {
    if fails.len() <= limit {
        return;
    }
    let first = fails.remove(0);
    fails.sort_by(|a, b| b.similarity_to_prev.cmp(&a.similarity_to_prev));
    fails.truncate(limit);
    fails.insert(0, first);
    fails.sort_by(|a, b| b.time_left.cmp(&a.time_left));
    for i in 1..fails.len() {
        let sim = similarity_score(&fails[i - 1].frame.image, &fails[i].frame.image);
        fails[i].similarity_to_prev = sim;
    }
}

/// Reduce and serialize the failure list for the timeout response. If
/// reduction dropped the absolute most-recent mismatch and the new tail
/// does not already look like it, it is re-appended.
pub fn failed_screens_payload(fails: &mut Vec<FailedMatch>) -> Vec<Value> {
    if let Some(final_mismatch) = fails.last().cloned() {
        reduce_to_biggest_changes(fails, FAILS_REDUCED);
        if let Some(tail) = fails.last() {
            if tail.frame.seq != final_mismatch.frame.seq {
                let sim = similarity_score(&tail.frame.image, &final_mismatch.frame.image);
                if sim < TAIL_DEDUP_THRESHOLD {
                    fails.push(final_mismatch);
                }
            }
        }
    }
    fails
        .iter()
        .map(|f| json!({"filename": f.filename, "candidates": f.candidates}))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use tempfile::TempDir;

    fn solid(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(
            32,
            32,
            image::Rgb([value, value, value]),
        ))
    }

    fn frame(value: u8, seq: u64) -> Arc<Frame> {
        Arc::new(Frame::new(solid(value), seq))
    }

    fn needle(name: &str, image: DynamicImage) -> Arc<Needle> {
        Arc::new(Needle {
            name: name.to_string(),
            tags: vec![name.to_string()],
            match_level: 96.0,
            image,
        })
    }

    fn failed(value: u8, seq: u64, time_left: i64, sim: u32) -> FailedMatch {
        let frame = frame(value, seq);
        let filename = frame.filename.clone();
        FailedMatch {
            frame,
            candidates: Vec::new(),
            time_left,
            similarity_to_prev: sim,
            filename,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_poll_is_pending() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        let outcome = engine
            .poll(Some(&frame(0, 1)), Instant::now(), &signals)
            .unwrap();
        assert!(matches!(outcome, PollOutcome::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_without_frame_is_pending() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        engine.arm(
            vec!["t".into()],
            vec![needle("t", solid(0))],
            Instant::now() + Duration::from_secs(30),
            false,
        );
        let outcome = engine.poll(None, Instant::now(), &signals).unwrap();
        assert!(matches!(outcome, PollOutcome::Pending));
        assert!(engine.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn matching_needle_disarms_and_reports() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        let shown = frame(128, 1);
        engine.arm(
            vec!["login".into()],
            vec![needle("login", solid(128))],
            Instant::now() + Duration::from_secs(30),
            false,
        );

        let outcome = engine.poll(Some(&shown), Instant::now(), &signals).unwrap();
        match outcome {
            PollOutcome::Matched(v) => {
                assert_eq!(v["found"]["name"], "login");
                assert_eq!(v["filename"], shown.filename.as_str());
            }
            _ => panic!("expected a match"),
        }
        assert!(!engine.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_poll_on_same_frame_skips() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        let shown = frame(0, 1);
        // Deadline chosen so the first poll runs a full search.
        engine.arm(
            vec!["x".into()],
            vec![needle("x", solid(255))],
            Instant::now() + Duration::from_secs(10),
            false,
        );

        let now = Instant::now();
        assert!(matches!(
            engine.poll(Some(&shown), now, &signals).unwrap(),
            PollOutcome::Pending
        ));
        let fails_after_first = engine.arming.as_ref().unwrap().fails.len();
        assert_eq!(fails_after_first, 1);

        // Same frame, same or weaker ratio: no new failure is sampled.
        assert!(matches!(
            engine.poll(Some(&shown), now, &signals).unwrap(),
            PollOutcome::Pending
        ));
        assert_eq!(engine.arming.as_ref().unwrap().fails.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_failed_screens_and_disarms() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        let shown = frame(0, 1);
        engine.arm(
            vec!["nope".into()],
            Vec::new(),
            Instant::now() + Duration::from_secs(1),
            false,
        );

        let late = Instant::now() + Duration::from_secs(3);
        match engine.poll(Some(&shown), late, &signals).unwrap() {
            PollOutcome::TimedOut(v) => {
                assert_eq!(v["timeout"], true);
                let screens = v["failed_screens"].as_array().unwrap();
                assert_eq!(screens.len(), 1);
                assert_eq!(screens[0]["filename"], shown.filename.as_str());
                assert!(screens[0]["candidates"].as_array().unwrap().is_empty());
            }
            _ => panic!("expected timeout"),
        }
        assert!(!engine.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_stop_file_freezes_without_disarming() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        signals.request_stop().unwrap();

        let mut engine = AssertEngine::new();
        engine.set_interactive(true);
        let shown = frame(0, 1);
        engine.arm(
            vec!["x".into()],
            vec![needle("x", solid(255))],
            Instant::now() + Duration::from_secs(30),
            false,
        );

        match engine.poll(Some(&shown), Instant::now(), &signals).unwrap() {
            PollOutcome::Waiting(v) => {
                assert_eq!(v["waiting_for_needle"], true);
                assert_eq!(v["filename"], shown.filename.as_str());
            }
            _ => panic!("expected waiting"),
        }
        assert!(engine.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_timeout_raises_stop_and_waits() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        engine.set_interactive(true);
        let shown = frame(0, 1);
        engine.arm(
            vec!["x".into()],
            vec![needle("x", solid(255))],
            Instant::now() + Duration::from_secs(1),
            false,
        );

        let late = Instant::now() + Duration::from_secs(3);
        match engine.poll(Some(&shown), late, &signals).unwrap() {
            PollOutcome::Waiting(_) => {}
            _ => panic!("expected waiting"),
        }
        assert!(signals.stop_requested());
        assert!(engine.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_timeout_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        let shown = frame(0, 1);
        engine.arm(
            vec!["x".into()],
            vec![needle("x", solid(255))],
            Instant::now() + Duration::from_secs(1),
            false,
        );
        engine.note_stall();

        let late = Instant::now() + Duration::from_secs(3);
        assert!(matches!(
            engine.poll(Some(&shown), late, &signals).unwrap(),
            PollOutcome::Stalled
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_rearms_with_fresh_state() {
        let tmp = TempDir::new().unwrap();
        let signals = ControlSignals::new(tmp.path());
        let mut engine = AssertEngine::new();
        let shown = frame(0, 1);
        engine.arm(
            vec!["x".into()],
            vec![needle("x", solid(255))],
            Instant::now() + Duration::from_secs(10),
            false,
        );
        engine.poll(Some(&shown), Instant::now(), &signals).unwrap();
        assert!(engine.has_checked());

        engine.retry(
            Instant::now() + Duration::from_secs(5),
            true,
            Some(vec![needle("x", solid(0))]),
        );
        assert!(!engine.has_checked());
        // The reloaded needle now matches the shown frame.
        match engine.poll(Some(&shown), Instant::now(), &signals).unwrap() {
            PollOutcome::Matched(_) => {}
            _ => panic!("expected a match after reload"),
        }
    }

    #[test]
    fn remaining_secs_floors_toward_timeout() {
        let base = Instant::now();
        assert_eq!(remaining_secs(base + Duration::from_secs(30), base), 30);
        assert_eq!(
            remaining_secs(base + Duration::from_millis(29_500), base),
            29
        );
        assert_eq!(remaining_secs(base, base), -1);
        assert_eq!(
            remaining_secs(base, base + Duration::from_millis(500)),
            -1
        );
        assert_eq!(remaining_secs(base, base + Duration::from_secs(2)), -3);
    }

    #[test]
    fn reducer_respects_cap_and_keeps_first() {
        let mut fails: Vec<FailedMatch> = (0..FAILS_SOFT_CAP as u64 + 1)
            .map(|i| failed((i % 256) as u8, i + 1, 100 - i as i64, (i % 29) as u32))
            .collect();
        let first_seq = fails[0].frame.seq;

        reduce_to_biggest_changes(&mut fails, FAILS_REDUCED);
        assert_eq!(fails.len(), FAILS_REDUCED + 1);
        assert_eq!(fails[0].frame.seq, first_seq);

        // Earliest-first ordering by time left.
        for pair in fails.windows(2) {
            assert!(pair[0].time_left >= pair[1].time_left);
        }
    }

    #[test]
    fn reducer_is_a_noop_below_limit() {
        let mut fails = vec![failed(0, 1, 5, 29), failed(255, 2, 4, 10)];
        reduce_to_biggest_changes(&mut fails, FAILS_REDUCED);
        assert_eq!(fails.len(), 2);
        assert_eq!(fails[0].similarity_to_prev, 29);
    }

    #[test]
    fn payload_reappends_dropped_final_mismatch() {
        // 70 alternating black/white failures; reduction keeps 21, and the
        // absolute last mismatch must still close the list if it went
        // missing and differs from the new tail.
        let mut fails: Vec<FailedMatch> = (0..70u64)
            .map(|i| {
                let shade = if i % 2 == 0 { 0 } else { 255 };
                failed(shade, i + 1, 200 - i as i64, 5)
            })
            .collect();
        let final_seq = fails.last().unwrap().frame.seq;

        let payload = failed_screens_payload(&mut fails);
        assert!(payload.len() <= FAILS_REDUCED + 2);
        assert_eq!(
            fails.last().unwrap().frame.seq,
            final_seq,
            "final mismatch must survive summarization"
        );
        assert_eq!(payload.len(), fails.len());
    }
}
