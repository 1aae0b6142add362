use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use image::{imageops, RgbImage};

/// Decode a base64-encoded image payload into an RGB frame, downscaled so
/// width does not exceed `target_width` (aspect ratio preserved, never
/// upscaled).
///
/// Payloads may carry a data-URL header (`data:image/jpeg;base64,...`);
/// everything after the first comma is treated as the body. Malformed
/// base64, unsupported codecs and zero-area images all return `None`; a
/// bad frame is skipped, never fatal to the verification.
pub fn decode_frame(payload: &str, target_width: u32) -> Option<RgbImage> {
    let body = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };

    let bytes = match BASE64_STANDARD.decode(body.trim()) {
        Ok(b) => b,
        Err(e) => {
            log::debug!("Frame base64 decode failed: {}", e);
            return None;
        }
    };

    let img = match image::load_from_memory(&bytes) {
        Ok(i) => i.to_rgb8(),
        Err(e) => {
            log::debug!("Frame image decode failed: {}", e);
            return None;
        }
    };

    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        log::debug!("Frame has zero area ({}x{}), skipping", w, h);
        return None;
    }

    if w > target_width {
        let scale = target_width as f32 / w as f32;
        let new_h = ((h as f32 * scale) as u32).max(1);
        return Some(imageops::resize(
            &img,
            target_width,
            new_h,
            imageops::FilterType::Triangle,
        ));
    }

    Some(img)
}
