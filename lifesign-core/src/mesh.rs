use crate::config::MeshConfig;
use image::{imageops, RgbImage};
use ndarray::ArrayView2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Side length of the square model input.
const INPUT_SIZE: u32 = 192;

/// Refined face-mesh topology point count (468 base + 10 iris).
pub const MESH_POINTS: usize = 478;

/// Unrefined exports carry 468 points; anything less is rejected.
const MIN_MESH_POINTS: usize = 468;

/// A single landmark in normalized frame coordinates (x, y in [0, 1]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn dist(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Dense landmark vector in face-mesh index order.
pub type Landmarks = Vec<Point>;

/// The seam between the matcher and whatever produces landmarks.
///
/// The production implementation is [`FaceMesh`]; tests script their own.
/// Implementations are not assumed reentrant; callers serialize access.
pub trait LandmarkSource {
    /// Landmarks of the single most confident face, or `None` when no face
    /// clears the confidence gate.
    fn landmarks(&mut self, frame: &RgbImage) -> Result<Option<Landmarks>, MeshError>;
}

/// ONNX face-mesh landmark provider.
///
/// Each call treats the frame as a still image: no inter-frame tracking, one
/// face per frame. The session holds native resources for the process
/// lifetime; construct once and share behind a lock.
pub struct FaceMesh {
    session: Session,
    min_face_confidence: f32,
}

impl FaceMesh {
    pub fn new(config: &MeshConfig) -> Result<Self, MeshError> {
        let session = Session::builder()
            .map_err(|e| MeshError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| MeshError::ModelLoad(e.to_string()))?
            .commit_from_file(&config.model_path)
            .map_err(|e| {
                MeshError::ModelLoad(format!(
                    "Failed to load model from {:?}: {}",
                    config.model_path, e
                ))
            })?;

        log::info!("Loaded face mesh model: {:?}", config.model_path);

        Ok(Self {
            session,
            min_face_confidence: config.min_face_confidence,
        })
    }

    /// Letterbox the frame into the square model input and return the
    /// placement needed to map coordinates back.
    fn preprocess(frame: &RgbImage) -> (([usize; 4], Vec<f32>), Letterbox) {
        let (w, h) = frame.dimensions();
        let scale = INPUT_SIZE as f32 / w.max(h) as f32;
        let scaled_w = ((w as f32 * scale) as u32).max(1);
        let scaled_h = ((h as f32 * scale) as u32).max(1);

        let resized = imageops::resize(frame, scaled_w, scaled_h, imageops::FilterType::Triangle);

        let offset_x = (INPUT_SIZE - scaled_w) / 2;
        let offset_y = (INPUT_SIZE - scaled_h) / 2;
        let mut canvas = RgbImage::new(INPUT_SIZE, INPUT_SIZE);
        imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

        // CHW tensor normalized to [-1, 1]
        let size = INPUT_SIZE as usize;
        let mut input_data = Vec::with_capacity(size * size * 3);
        for c in 0..3 {
            for y in 0..INPUT_SIZE {
                for x in 0..INPUT_SIZE {
                    let pixel = canvas.get_pixel(x, y);
                    input_data.push(pixel[c] as f32 / 255.0 * 2.0 - 1.0);
                }
            }
        }

        let letterbox = Letterbox {
            scale,
            offset_x: offset_x as f32,
            offset_y: offset_y as f32,
            frame_w: w as f32,
            frame_h: h as f32,
        };

        (([1, 3, size, size], input_data), letterbox)
    }
}

impl LandmarkSource for FaceMesh {
    fn landmarks(&mut self, frame: &RgbImage) -> Result<Option<Landmarks>, MeshError> {
        let (input_tensor, letterbox) = Self::preprocess(frame);

        let input_value = Value::from_array(input_tensor)
            .map_err(|e| MeshError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|e| MeshError::Inference(e.to_string()))?;

        // The mesh exports carry a landmark tensor (N*3 floats) and a scalar
        // face-presence score; output order varies between conversions, so
        // pick by shape.
        let mut landmark_data: Option<Vec<f32>> = None;
        let mut face_score: Option<f32> = None;

        for i in 0..outputs.len() {
            let (shape, data) = match outputs[i].try_extract_tensor::<f32>() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let count: usize = shape.iter().map(|&d| d as usize).product();
            if count == 1 {
                face_score = Some(data[0]);
            } else if count % 3 == 0
                && count / 3 >= MIN_MESH_POINTS
                && landmark_data.as_ref().map_or(true, |l| count > l.len())
            {
                landmark_data = Some(data[..count].to_vec());
            }
        }

        let data = landmark_data.ok_or_else(|| {
            MeshError::Inference("Model produced no landmark tensor".to_string())
        })?;

        if let Some(raw) = face_score {
            // Some exports keep the face flag as a logit
            let score = if (0.0..=1.0).contains(&raw) {
                raw
            } else {
                1.0 / (1.0 + (-raw).exp())
            };
            if score < self.min_face_confidence {
                log::debug!("Face score {:.3} below threshold, reporting no face", score);
                return Ok(None);
            }
        }

        let points = data.len() / 3;
        let view = ArrayView2::from_shape((points, 3), &data[..])
            .map_err(|e| MeshError::Inference(format!("Landmark tensor reshape: {}", e)))?;

        let mut landmarks = Vec::with_capacity(points);
        for row in view.rows() {
            landmarks.push(letterbox.to_frame(row[0], row[1]));
        }

        Ok(Some(landmarks))
    }
}

/// Placement of the scaled frame inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: f32,
    offset_y: f32,
    frame_w: f32,
    frame_h: f32,
}

impl Letterbox {
    /// Map a landmark from model-input pixel coordinates to normalized
    /// frame coordinates, clamped to [0, 1].
    fn to_frame(&self, x: f32, y: f32) -> Point {
        let fx = (x - self.offset_x) / (self.scale * self.frame_w);
        let fy = (y - self.offset_y) / (self.scale * self.frame_h);
        Point {
            x: fx.clamp(0.0, 1.0),
            y: fy.clamp(0.0, 1.0),
        }
    }
}
