//! Temporal matching of gesture detections against ordered challenge steps.
//!
//! The matcher walks the frame sequence once, always looking for the single
//! currently-active step. A step commits only after the gesture holds for
//! `min_consecutive_frames` face-bearing frames, which is what defeats
//! single-frame glitches and static imagery.

use crate::config::{DetectorConfig, VisionConfig};
use crate::detect::detect;
use crate::frame::decode_frame;
use crate::gesture::GestureKind;
use crate::mesh::{LandmarkSource, MeshError};
use serde::{Deserialize, Serialize};

/// Outcome of one challenge step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: GestureKind,
    pub detected: bool,
    pub confidence: f32,
    /// Frame at which the step committed; -1 when it never did.
    pub frame_idx: i32,
}

impl StepResult {
    fn pending(step: GestureKind) -> Self {
        Self {
            step,
            detected: false,
            confidence: 0.0,
            frame_idx: -1,
        }
    }
}

/// Result of analysing a frame sequence against a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub liveness_score: f32,
    pub step_results: Vec<StepResult>,
    pub face_detected_count: u32,
    pub total_frames: usize,
    pub temporal_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerifyOutcome {
    fn fail(reason: &str) -> Self {
        Self {
            passed: false,
            liveness_score: 0.0,
            step_results: Vec::new(),
            face_detected_count: 0,
            total_frames: 0,
            temporal_valid: false,
            error: Some(reason.to_string()),
        }
    }

    pub fn steps_passed(&self) -> usize {
        self.step_results.iter().filter(|s| s.detected).count()
    }
}

/// Score breakdown computed from the matcher's final state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub step_score: f32,
    pub face_score: f32,
    pub conf_score: f32,
    pub liveness_score: f32,
    pub temporal_valid: bool,
    pub passed: bool,
}

/// Analyse a sequence of base64 frame payloads against ordered challenge
/// steps.
///
/// Undecodable frames are skipped; face-absent frames reset the
/// consecutive-detection counter. Provider failures surface as errors:
/// the verdict must be a property of the whole sequence, not of a
/// half-working pipeline.
pub fn analyze_frames(
    frames: &[String],
    steps: &[GestureKind],
    source: &mut dyn LandmarkSource,
    vision: &VisionConfig,
    detector: &DetectorConfig,
) -> Result<VerifyOutcome, MeshError> {
    let total_frames = frames.len();
    if total_frames == 0 {
        return Ok(VerifyOutcome::fail("No frames provided"));
    }

    let mut step_results: Vec<StepResult> =
        steps.iter().map(|&s| StepResult::pending(s)).collect();
    let mut current_step = 0usize;
    let mut consecutive = 0u32;
    let mut face_detected_count = 0u32;

    for (frame_idx, payload) in frames.iter().enumerate() {
        if current_step >= steps.len() {
            // All steps satisfied; remaining frames are not processed.
            break;
        }

        let frame = match decode_frame(payload, vision.frame_width) {
            Some(f) => f,
            None => continue,
        };

        let lm = match source.landmarks(&frame)? {
            Some(lm) => lm,
            None => {
                consecutive = 0;
                continue;
            }
        };

        face_detected_count += 1;

        let active = steps[current_step];
        let (detected, confidence) = detect(&lm, active, detector);

        if detected {
            consecutive += 1;
            log::debug!(
                "Frame {}: {} held for {}/{} frames (confidence {:.3})",
                frame_idx,
                active,
                consecutive,
                vision.min_consecutive_frames,
                confidence
            );
            if consecutive >= vision.min_consecutive_frames {
                step_results[current_step] = StepResult {
                    step: active,
                    detected: true,
                    confidence,
                    frame_idx: frame_idx as i32,
                };
                log::info!("Step {} ({}) committed at frame {}", current_step, active, frame_idx);
                current_step += 1;
                consecutive = 0;
            }
        } else {
            consecutive = 0;
        }
    }

    let score = score(&step_results, face_detected_count, total_frames);
    log::info!(
        "Analysis complete: {}/{} steps, {} face frames of {}, score {:.1}, passed={}",
        step_results.iter().filter(|s| s.detected).count(),
        steps.len(),
        face_detected_count,
        total_frames,
        score.liveness_score,
        score.passed
    );

    Ok(VerifyOutcome {
        passed: score.passed,
        liveness_score: score.liveness_score,
        step_results,
        face_detected_count,
        total_frames,
        temporal_valid: score.temporal_valid,
        error: None,
    })
}

/// Compute the composite liveness score and pass verdict.
///
/// 60 points for step completion, 20 for face-presence rate, 20 for mean
/// commit confidence. Pure over its inputs.
pub fn score(step_results: &[StepResult], face_detected_count: u32, total_frames: usize) -> Score {
    let total_steps = step_results.len();
    let committed: Vec<&StepResult> = step_results.iter().filter(|s| s.detected).collect();
    let steps_passed = committed.len();

    let temporal_valid = if steps_passed > 1 {
        committed.windows(2).all(|w| w[0].frame_idx < w[1].frame_idx)
    } else {
        steps_passed > 0
    };

    let step_score = if total_steps > 0 {
        steps_passed as f32 / total_steps as f32 * 60.0
    } else {
        0.0
    };

    let face_score = if total_frames > 0 {
        face_detected_count as f32 / total_frames as f32 * 20.0
    } else {
        0.0
    };

    let mean_conf = committed.iter().map(|s| s.confidence).sum::<f32>()
        / steps_passed.max(1) as f32;
    let conf_score = mean_conf * 20.0;

    let liveness_score = round1((step_score + face_score + conf_score).min(100.0));
    let passed = steps_passed == total_steps && temporal_valid && liveness_score >= 60.0;

    Score {
        step_score,
        face_score,
        conf_score,
        liveness_score,
        temporal_valid,
        passed,
    }
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::detect::testfaces;
    use crate::mesh::Landmarks;
    use base64::prelude::BASE64_STANDARD;
    use base64::Engine;
    use image::codecs::png::PngEncoder;
    use image::{ExtendedColorType, ImageEncoder, RgbImage};

    /// Landmark source that replays a script, one entry per decoded frame.
    struct Scripted {
        seq: Vec<Option<Landmarks>>,
        consumed: usize,
    }

    impl Scripted {
        fn new(seq: Vec<Option<Landmarks>>) -> Self {
            Self { seq, consumed: 0 }
        }
    }

    impl LandmarkSource for Scripted {
        fn landmarks(&mut self, _frame: &RgbImage) -> Result<Option<Landmarks>, MeshError> {
            let entry = self.seq.get(self.consumed).cloned().flatten();
            self.consumed += 1;
            Ok(entry)
        }
    }

    fn png_frame() -> String {
        let img = RgbImage::from_pixel(4, 4, image::Rgb([90, 90, 90]));
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), 4, 4, ExtendedColorType::Rgb8)
            .unwrap();
        BASE64_STANDARD.encode(&buf)
    }

    fn frames(n: usize) -> Vec<String> {
        (0..n).map(|_| png_frame()).collect()
    }

    fn run(
        payloads: &[String],
        steps: &[GestureKind],
        script: Vec<Option<Landmarks>>,
    ) -> VerifyOutcome {
        let cfg = Config::default();
        let mut source = Scripted::new(script);
        analyze_frames(payloads, steps, &mut source, &cfg.vision, &cfg.detector).unwrap()
    }

    const STEPS: [GestureKind; 3] = [
        GestureKind::Blink,
        GestureKind::TurnRight,
        GestureKind::Smile,
    ];

    #[test]
    fn test_static_photo_attack_rejected() {
        // Four frames of the same unmoving face: no step fires.
        let script = vec![Some(testfaces::neutral()); 4];
        let outcome = run(&frames(4), &STEPS, script);

        assert!(!outcome.passed);
        assert_eq!(outcome.face_detected_count, 4);
        assert_eq!(outcome.steps_passed(), 0);
        assert!(!outcome.temporal_valid);
    }

    #[test]
    fn test_perfect_run_passes() {
        // Blink on frames 2-3, turn right on 6-7, smile on 10-11.
        let mut script = vec![Some(testfaces::neutral()); 12];
        script[2] = Some(testfaces::blinking());
        script[3] = Some(testfaces::blinking());
        script[6] = Some(testfaces::turned_right());
        script[7] = Some(testfaces::turned_right());
        script[10] = Some(testfaces::smiling());
        script[11] = Some(testfaces::smiling());

        let outcome = run(&frames(12), &STEPS, script);

        assert!(outcome.passed);
        assert!(outcome.temporal_valid);
        let indices: Vec<i32> = outcome.step_results.iter().map(|s| s.frame_idx).collect();
        assert_eq!(indices, vec![3, 7, 11]);
        assert!(outcome.liveness_score >= 80.0);
    }

    #[test]
    fn test_out_of_order_execution_fails() {
        // Smile first (1-2), then blink (4-5), then turn right (8-9). The
        // smile is wasted: the matcher is still waiting for the blink.
        let mut script = vec![Some(testfaces::neutral()); 10];
        script[1] = Some(testfaces::smiling());
        script[2] = Some(testfaces::smiling());
        script[4] = Some(testfaces::blinking());
        script[5] = Some(testfaces::blinking());
        script[8] = Some(testfaces::turned_right());
        script[9] = Some(testfaces::turned_right());

        let outcome = run(&frames(10), &STEPS, script);

        assert!(!outcome.passed);
        assert_eq!(outcome.steps_passed(), 2);
        assert_eq!(outcome.step_results[0].frame_idx, 5);
        assert_eq!(outcome.step_results[1].frame_idx, 9);
        assert!(!outcome.step_results[2].detected);
        assert_eq!(outcome.step_results[2].frame_idx, -1);
    }

    #[test]
    fn test_single_transient_detection_does_not_commit() {
        let mut script = vec![Some(testfaces::neutral()); 6];
        script[2] = Some(testfaces::blinking());

        let outcome = run(&frames(6), &[GestureKind::Blink], script);

        assert_eq!(outcome.steps_passed(), 0);
        assert!(!outcome.passed);
    }

    #[test]
    fn test_face_absence_resets_consecutive_count() {
        // Blink, face lost, blink again: the counter must restart.
        let script = vec![
            Some(testfaces::blinking()),
            None,
            Some(testfaces::blinking()),
            None,
        ];
        let outcome = run(&frames(4), &[GestureKind::Blink], script);
        assert_eq!(outcome.steps_passed(), 0);
        assert_eq!(outcome.face_detected_count, 2);
    }

    #[test]
    fn test_undecodable_frames_are_skipped() {
        // Garbage payloads never reach the landmark source.
        let mut payloads = frames(4);
        payloads.insert(0, "!!garbage!!".to_string());
        payloads.insert(3, "!!garbage!!".to_string());

        let script = vec![Some(testfaces::blinking()); 4];
        let cfg = Config::default();
        let mut source = Scripted::new(script);
        let outcome = analyze_frames(
            &payloads,
            &[GestureKind::Blink],
            &mut source,
            &cfg.vision,
            &cfg.detector,
        )
        .unwrap();

        assert_eq!(source.consumed, 2); // early exit after the commit
        assert_eq!(outcome.steps_passed(), 1);
        assert_eq!(outcome.total_frames, 6);
    }

    #[test]
    fn test_early_exit_stops_frame_processing() {
        // After the last step commits, no further frame is analysed.
        let script = vec![Some(testfaces::blinking()); 2];
        let payloads = frames(10);
        let cfg = Config::default();
        let mut source = Scripted::new(script);
        let outcome = analyze_frames(
            &payloads,
            &[GestureKind::Blink],
            &mut source,
            &cfg.vision,
            &cfg.detector,
        )
        .unwrap();

        assert!(outcome.passed);
        assert_eq!(source.consumed, 2);
        assert_eq!(outcome.face_detected_count, 2);
        assert_eq!(outcome.total_frames, 10);
    }

    #[test]
    fn test_early_exit_preserves_step_results() {
        // Truncating the list right after the final commit leaves the
        // per-step outcomes untouched.
        let mut script = vec![Some(testfaces::neutral()); 8];
        script[1] = Some(testfaces::blinking());
        script[2] = Some(testfaces::blinking());

        let full = run(&frames(8), &[GestureKind::Blink], script.clone());
        script.truncate(3);
        let truncated = run(&frames(3), &[GestureKind::Blink], script);

        assert_eq!(full.step_results, truncated.step_results);
    }

    #[test]
    fn test_prepended_dead_frames_do_not_reduce_steps_passed() {
        let mut script = vec![Some(testfaces::blinking()); 2];
        let base = run(&frames(2), &[GestureKind::Blink], script.clone());

        script.insert(0, None);
        script.insert(0, None);
        let mut payloads = vec!["!!garbage!!".to_string()];
        payloads.extend(frames(4));
        let cfg = Config::default();
        let mut source = Scripted::new(script);
        let padded = analyze_frames(
            &payloads,
            &[GestureKind::Blink],
            &mut source,
            &cfg.vision,
            &cfg.detector,
        )
        .unwrap();

        assert!(padded.steps_passed() >= base.steps_passed());
    }

    #[test]
    fn test_empty_frame_list_fails_fast() {
        let outcome = run(&[], &STEPS, vec![]);
        assert!(!outcome.passed);
        assert_eq!(outcome.liveness_score, 0.0);
        assert_eq!(outcome.face_detected_count, 0);
        assert!(!outcome.temporal_valid);
        assert_eq!(outcome.error.as_deref(), Some("No frames provided"));
    }

    #[test]
    fn test_all_frames_faceless_scores_zero_presence() {
        let script = vec![None, None, None];
        let outcome = run(&frames(3), &STEPS, script);
        assert!(!outcome.passed);
        assert_eq!(outcome.face_detected_count, 0);
        assert_eq!(outcome.liveness_score, 0.0);
    }

    #[test]
    fn test_matcher_is_deterministic() {
        let mut script = vec![Some(testfaces::neutral()); 6];
        script[1] = Some(testfaces::blinking());
        script[2] = Some(testfaces::blinking());

        let first = run(&frames(6), &[GestureKind::Blink], script.clone());
        for _ in 0..5 {
            assert_eq!(run(&frames(6), &[GestureKind::Blink], script.clone()), first);
        }
    }

    // -- scoring ----------------------------------------------------------

    fn committed(step: GestureKind, confidence: f32, frame_idx: i32) -> StepResult {
        StepResult {
            step,
            detected: true,
            confidence,
            frame_idx,
        }
    }

    #[test]
    fn test_score_full_marks_capped_at_100() {
        let results = vec![
            committed(GestureKind::Blink, 1.0, 1),
            committed(GestureKind::Smile, 1.0, 3),
        ];
        let s = score(&results, 10, 10);
        assert_eq!(s.liveness_score, 100.0);
        assert!(s.passed);
    }

    #[test]
    fn test_score_bounds() {
        let results = vec![
            committed(GestureKind::Blink, 0.4, 2),
            StepResult::pending(GestureKind::Smile),
        ];
        let s = score(&results, 3, 9);
        assert!(s.liveness_score >= 0.0 && s.liveness_score <= 100.0);
        // 30 step + 6.67 face + 8 conf
        assert!((s.liveness_score - 44.7).abs() < 0.1);
        assert!(!s.passed);
    }

    #[test]
    fn test_score_zero_frames_yields_zero_face_score() {
        let s = score(&[StepResult::pending(GestureKind::Blink)], 0, 0);
        assert_eq!(s.face_score, 0.0);
        assert_eq!(s.liveness_score, 0.0);
    }

    #[test]
    fn test_temporal_validity_vacuous_for_single_commit() {
        // Preserved quirk: one committed step of three still counts as
        // temporally valid.
        let results = vec![
            committed(GestureKind::Blink, 0.9, 4),
            StepResult::pending(GestureKind::Smile),
            StepResult::pending(GestureKind::TurnLeft),
        ];
        let s = score(&results, 5, 5);
        assert!(s.temporal_valid);
        assert!(!s.passed);
    }

    #[test]
    fn test_temporal_validity_rejects_regression() {
        let results = vec![
            committed(GestureKind::Blink, 0.9, 7),
            committed(GestureKind::Smile, 0.9, 3),
        ];
        let s = score(&results, 8, 8);
        assert!(!s.temporal_valid);
        assert!(!s.passed);
    }

    #[test]
    fn test_pass_requires_all_steps() {
        let results = vec![
            committed(GestureKind::Blink, 1.0, 1),
            StepResult::pending(GestureKind::Smile),
        ];
        let s = score(&results, 10, 10);
        assert!(!s.passed);
    }
}
