//! Gesture detectors over normalized face-mesh landmarks.
//!
//! Every detector is a pure function of the landmark vector and the
//! configured thresholds; identical input always yields identical output.

use crate::config::DetectorConfig;
use crate::gesture::GestureKind;
use crate::mesh::Landmarks;

const EPS: f32 = 1e-6;

// Canonical face-mesh indices (478-point topology)
const LEFT_EYE_IDX: [usize; 6] = [33, 160, 158, 133, 153, 144];
const RIGHT_EYE_IDX: [usize; 6] = [362, 385, 387, 263, 373, 380];
const UPPER_LIP_IDX: usize = 13;
const LOWER_LIP_IDX: usize = 14;
const LEFT_LIP_IDX: usize = 61;
const RIGHT_LIP_IDX: usize = 291;
const NOSE_TIP_IDX: usize = 1;
const LEFT_BROW_IDX: usize = 105;
const RIGHT_BROW_IDX: usize = 334;
const LEFT_EYE_TOP_IDX: usize = 159;
const RIGHT_EYE_TOP_IDX: usize = 386;

// Eye width for normalization
const LEFT_EYE_WIDTH_IDX1: usize = 33;
const LEFT_EYE_WIDTH_IDX2: usize = 133;

/// Highest landmark index any detector touches.
const HIGHEST_INDEX: usize = 387;

/// Eye aspect ratio over one eye's six landmarks; drops sharply on a blink.
fn ear(lm: &Landmarks, indices: &[usize; 6]) -> f32 {
    let v1 = lm[indices[1]].dist(&lm[indices[5]]);
    let v2 = lm[indices[2]].dist(&lm[indices[4]]);
    let h = lm[indices[0]].dist(&lm[indices[3]]);
    (v1 + v2) / (2.0 * h + EPS)
}

/// Mouth width / height; high when smiling.
fn smile_ratio(lm: &Landmarks) -> f32 {
    let w = lm[LEFT_LIP_IDX].dist(&lm[RIGHT_LIP_IDX]);
    let h = lm[UPPER_LIP_IDX].dist(&lm[LOWER_LIP_IDX]);
    w / (h + EPS)
}

/// Mouth height / width; high when the mouth is open.
fn mouth_open_ratio(lm: &Landmarks) -> f32 {
    let w = lm[LEFT_LIP_IDX].dist(&lm[RIGHT_LIP_IDX]);
    let h = lm[UPPER_LIP_IDX].dist(&lm[LOWER_LIP_IDX]);
    h / (w + EPS)
}

/// Brow-to-eyelid distance, normalized by eye width.
fn brow_raise_ratio(lm: &Landmarks) -> f32 {
    let left = lm[LEFT_BROW_IDX].dist(&lm[LEFT_EYE_TOP_IDX]);
    let right = lm[RIGHT_BROW_IDX].dist(&lm[RIGHT_EYE_TOP_IDX]);
    let eye_width = lm[LEFT_EYE_WIDTH_IDX1].dist(&lm[LEFT_EYE_WIDTH_IDX2]);
    (left + right) / (2.0 * eye_width + EPS)
}

/// Normalized horizontal nose-tip position (0 = far left of frame).
fn nose_offset(lm: &Landmarks) -> f32 {
    lm[NOSE_TIP_IDX].x
}

fn round3(v: f32) -> f32 {
    (v * 1000.0).round() / 1000.0
}

/// Evaluate one gesture against a landmark vector.
///
/// Returns `(detected, confidence)`; confidence is 0 whenever the gesture
/// is not detected and rounded to 3 decimals otherwise.
pub fn detect(lm: &Landmarks, action: GestureKind, cfg: &DetectorConfig) -> (bool, f32) {
    if lm.len() <= HIGHEST_INDEX {
        log::warn!("Landmark vector too short ({} points)", lm.len());
        return (false, 0.0);
    }

    match action {
        GestureKind::Blink => {
            let avg_ear = (ear(lm, &LEFT_EYE_IDX) + ear(lm, &RIGHT_EYE_IDX)) / 2.0;
            let detected = avg_ear < cfg.ear_threshold;
            if !detected {
                return (false, 0.0);
            }
            (true, round3((1.0 - avg_ear / cfg.ear_threshold).clamp(0.0, 1.0)))
        }
        GestureKind::Smile => {
            let ratio = smile_ratio(lm);
            let detected = ratio > cfg.smile_ratio_threshold;
            if !detected {
                return (false, 0.0);
            }
            (true, round3((ratio / (cfg.smile_ratio_threshold * 1.5)).min(1.0)))
        }
        GestureKind::MouthOpen => {
            let ratio = mouth_open_ratio(lm);
            let detected = ratio > cfg.mouth_open_threshold;
            if !detected {
                return (false, 0.0);
            }
            (true, round3((ratio / (cfg.mouth_open_threshold * 1.5)).min(1.0)))
        }
        GestureKind::TurnLeft => {
            let nx = nose_offset(lm);
            let detected = nx > cfg.head_turn_nose_x;
            if !detected {
                return (false, 0.0);
            }
            (true, round3(((nx - 0.5) * 4.0).clamp(0.0, 1.0)))
        }
        GestureKind::TurnRight => {
            let nx = nose_offset(lm);
            let detected = nx < 1.0 - cfg.head_turn_nose_x;
            if !detected {
                return (false, 0.0);
            }
            (true, round3(((0.5 - nx) * 4.0).clamp(0.0, 1.0)))
        }
        GestureKind::BrowRaise => {
            let ratio = brow_raise_ratio(lm);
            let detected = ratio > cfg.brow_raise_threshold;
            if !detected {
                return (false, 0.0);
            }
            (true, round3((ratio / (cfg.brow_raise_threshold * 1.4)).min(1.0)))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gesture::GestureKind;

    fn cfg() -> DetectorConfig {
        Config::default().detector
    }

    #[test]
    fn test_neutral_face_triggers_nothing() {
        let lm = testfaces::neutral();
        for kind in GestureKind::POOL {
            let (detected, confidence) = detect(&lm, kind, &cfg());
            assert!(!detected, "{} fired on a neutral face", kind);
            assert_eq!(confidence, 0.0);
        }
    }

    #[test]
    fn test_each_gesture_detects_its_own_face() {
        for kind in GestureKind::POOL {
            let lm = testfaces::performing(kind);
            let (detected, confidence) = detect(&lm, kind, &cfg());
            assert!(detected, "{} missed its own face", kind);
            assert!(confidence > 0.0 && confidence <= 1.0, "{} confidence out of range", kind);
        }
    }

    #[test]
    fn test_blink_confidence_tracks_ear() {
        // EAR 0.02 against threshold 0.21 -> confidence ~0.905
        let (detected, confidence) = detect(&testfaces::blinking(), GestureKind::Blink, &cfg());
        assert!(detected);
        assert!((confidence - 0.905).abs() < 0.02, "got {}", confidence);
    }

    #[test]
    fn test_smile_confidence_saturates() {
        // Ratio 8.0 over denominator 6.0 saturates at 1.0
        let (_, confidence) = detect(&testfaces::smiling(), GestureKind::Smile, &cfg());
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn test_turn_confidences_are_symmetric() {
        let (_, left) = detect(&testfaces::turned_left(), GestureKind::TurnLeft, &cfg());
        let (_, right) = detect(&testfaces::turned_right(), GestureKind::TurnRight, &cfg());
        assert!((left - right).abs() < 1e-6);
        assert!((left - 0.48).abs() < 0.01, "got {}", left);
    }

    #[test]
    fn test_turned_left_does_not_read_as_right() {
        let (detected, _) = detect(&testfaces::turned_left(), GestureKind::TurnRight, &cfg());
        assert!(!detected);
    }

    #[test]
    fn test_detector_is_pure() {
        let lm = testfaces::mouth_open();
        let first = detect(&lm, GestureKind::MouthOpen, &cfg());
        for _ in 0..10 {
            assert_eq!(detect(&lm, GestureKind::MouthOpen, &cfg()), first);
        }
    }

    #[test]
    fn test_short_vector_rejected() {
        let lm = vec![crate::mesh::Point { x: 0.5, y: 0.5 }; 100];
        for kind in GestureKind::POOL {
            assert_eq!(detect(&lm, kind, &cfg()), (false, 0.0));
        }
    }

    #[test]
    fn test_confidence_rounded_to_three_decimals() {
        let (_, confidence) = detect(&testfaces::blinking(), GestureKind::Blink, &cfg());
        assert_eq!(confidence, (confidence * 1000.0).round() / 1000.0);
    }
}
