pub mod challenge;
pub mod config;
pub mod detect;
pub mod frame;
pub mod gesture;
pub mod matcher;
pub mod mesh;
pub mod store;
pub mod token;

use challenge::{Challenge, ChallengeError};
use config::Config;
use gesture::GestureKind;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_cross_mut;
use matcher::{analyze_frames, VerifyOutcome};
use mesh::{FaceMesh, LandmarkSource, Landmarks};
use std::sync::{Arc, Mutex};
use store::{ChallengeStore, VerificationAttempt};
use thiserror::Error;
use token::IssuedToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("{0}")]
    Challenge(#[from] ChallengeError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Landmark provider error: {0}")]
    Mesh(#[from] mesh::MeshError),
    #[error("Storage error: {0}")]
    Storage(#[from] store::StorageError),
    #[error("Token error: {0}")]
    Token(#[from] token::TokenError),
    #[error("{0}")]
    Other(String),
}

/// Request metadata recorded on the audit trail.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Result of a verification: the pipeline outcome plus the credential
/// minted when it passed.
#[derive(Debug)]
pub struct VerifyReport {
    pub outcome: VerifyOutcome,
    pub credential: Option<IssuedToken>,
}

/// Result of an attack simulation run.
#[derive(Debug)]
pub struct AttackSimReport {
    pub outcome: VerifyOutcome,
    pub rejection_reason: String,
    pub recommendation: String,
}

/// Gesture sequence used by the attack simulation.
const ATTACK_SIM_STEPS: [GestureKind; 3] = [
    GestureKind::Blink,
    GestureKind::TurnRight,
    GestureKind::Smile,
];

/// Liveness verification orchestrator.
///
/// Owns the configuration, the challenge store handle, and the landmark
/// provider. The provider is constructed lazily on first use and retained
/// for the life of the process; a mutex serializes access since the model
/// is not assumed reentrant. The verify path itself is synchronous and
/// CPU-bound: callers running an async transport should dispatch it onto a
/// worker pool.
pub struct Verifier {
    config: Config,
    store: Arc<dyn ChallengeStore>,
    mesh: Mutex<Option<Box<dyn LandmarkSource + Send>>>,
}

impl Verifier {
    pub fn new(config: Config, store: Arc<dyn ChallengeStore>) -> Self {
        Self {
            config,
            store,
            mesh: Mutex::new(None),
        }
    }

    /// Build a verifier around a pre-constructed landmark source instead of
    /// the ONNX face mesh. This is the seam for alternative providers.
    pub fn with_source(
        config: Config,
        store: Arc<dyn ChallengeStore>,
        source: Box<dyn LandmarkSource + Send>,
    ) -> Self {
        Self {
            config,
            store,
            mesh: Mutex::new(Some(source)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Generate and persist a fresh single-use challenge.
    pub fn generate_challenge(&self) -> Result<Challenge, Error> {
        let challenge = Challenge::generate(&self.config.challenge);
        self.store.put_challenge(&challenge)?;
        Ok(challenge)
    }

    /// Verify liveness: consume the challenge, analyse the frames against
    /// its steps, persist the attempt, and mint a credential on pass.
    ///
    /// Protocol failures (unknown, replayed, expired challenge, bad input)
    /// are reported before any frame work begins. Once `used` is set it is
    /// never rolled back, even if the pipeline fails afterwards.
    pub fn verify(
        &self,
        challenge_id: Uuid,
        frames: &[String],
        client: ClientInfo,
    ) -> Result<VerifyReport, Error> {
        if frames.is_empty() {
            return Err(Error::InvalidInput("No frames provided".to_string()));
        }
        if frames.len() > self.config.vision.max_frames {
            return Err(Error::InvalidInput(format!(
                "Too many frames: {} (max {})",
                frames.len(),
                self.config.vision.max_frames
            )));
        }

        let challenge = self
            .store
            .get_challenge(challenge_id)?
            .ok_or(ChallengeError::NotFound(challenge_id))?;

        if challenge.used {
            return Err(ChallengeError::AlreadyUsed(challenge_id).into());
        }
        if challenge.is_expired(chrono::Utc::now()) {
            return Err(ChallengeError::Expired(challenge_id).into());
        }

        // One-time use: whoever wins the compare-and-set owns this
        // challenge; everyone else sees a replay.
        if !self.store.mark_used(challenge_id)? {
            return Err(ChallengeError::AlreadyUsed(challenge_id).into());
        }

        log::info!(
            "Verifying challenge {} against {} frames",
            challenge_id,
            frames.len()
        );

        let outcome = {
            let mut guard = self.mesh.lock().unwrap();
            let source = Self::ensure_mesh_loaded(&mut guard, &self.config)?;
            let outcome = analyze_frames(
                frames,
                &challenge.steps,
                &mut *source,
                &self.config.vision,
                &self.config.detector,
            )?;

            if self.config.debug.save_frames {
                if let Err(e) = self.save_debug_frame(frames, source, challenge_id) {
                    log::warn!("Failed to save debug frame: {}", e);
                }
            }

            outcome
        };

        let attempt = VerificationAttempt {
            id: Uuid::new_v4(),
            challenge_id,
            liveness_score: outcome.liveness_score,
            passed: outcome.passed,
            ip_address: client.ip_address,
            user_agent: client.user_agent,
            details: outcome.step_results.clone(),
            created_at: chrono::Utc::now(),
        };
        self.store.put_attempt(&attempt)?;

        let credential = if outcome.passed {
            let subject = format!("verified-user-{}", challenge_id);
            let label = format!("Challenge {}", &challenge_id.to_string()[..8]);
            let (issued, record) = token::mint(
                &subject,
                Some(label),
                outcome.liveness_score,
                self.config.token.ttl_seconds,
            );
            self.store.put_token(&record)?;
            Some(issued)
        } else {
            None
        };

        Ok(VerifyReport {
            outcome,
            credential,
        })
    }

    /// Run the pipeline against the fixed attack-simulation sequence
    /// without touching challenge state.
    pub fn attack_sim(&self, frames: &[String]) -> Result<AttackSimReport, Error> {
        if frames.is_empty() {
            return Err(Error::InvalidInput("No frames provided".to_string()));
        }
        if frames.len() > self.config.vision.max_frames {
            return Err(Error::InvalidInput(format!(
                "Too many frames: {} (max {})",
                frames.len(),
                self.config.vision.max_frames
            )));
        }

        let outcome = {
            let mut guard = self.mesh.lock().unwrap();
            let source = Self::ensure_mesh_loaded(&mut guard, &self.config)?;
            analyze_frames(
                frames,
                &ATTACK_SIM_STEPS,
                source,
                &self.config.vision,
                &self.config.detector,
            )?
        };

        let rejection_reason = if outcome.passed {
            "N/A: passed (unexpected for attack simulation)".to_string()
        } else if outcome.face_detected_count == 0 {
            "No face detected in any frame".to_string()
        } else if !outcome.temporal_valid {
            "No temporal variation detected, likely a static image".to_string()
        } else if outcome.liveness_score < 60.0 {
            format!(
                "Liveness score too low ({:.1}%): insufficient gestural response",
                outcome.liveness_score
            )
        } else {
            "Frames showed motion but failed challenge ordering".to_string()
        };

        let recommendation = if outcome.passed {
            "Frames unexpectedly passed; review challenge difficulty.".to_string()
        } else {
            "Attack rejected. Static images and replays cannot produce the \
             required temporal sequence of gestures."
                .to_string()
        };

        Ok(AttackSimReport {
            outcome,
            rejection_reason,
            recommendation,
        })
    }

    /// Initialize the landmark provider on first use (lazy singleton).
    fn ensure_mesh_loaded<'a>(
        guard: &'a mut Option<Box<dyn LandmarkSource + Send>>,
        config: &Config,
    ) -> Result<&'a mut (dyn LandmarkSource + Send), Error> {
        if guard.is_none() {
            log::info!("Loading face mesh model...");
            *guard = Some(Box::new(FaceMesh::new(&config.mesh)?));
        }
        Ok(guard.as_mut().expect("mesh provider just initialized").as_mut())
    }

    /// Annotate the first face-bearing frame with its landmarks and write
    /// it to the debug directory.
    fn save_debug_frame(
        &self,
        frames: &[String],
        source: &mut (dyn LandmarkSource + Send),
        challenge_id: Uuid,
    ) -> Result<(), Error> {
        for payload in frames {
            let frame = match frame::decode_frame(payload, self.config.vision.frame_width) {
                Some(f) => f,
                None => continue,
            };
            let lm = match source.landmarks(&frame)? {
                Some(lm) => lm,
                None => continue,
            };

            let dir = Self::ensure_debug_dir(&self.config.debug.output_dir)?;
            let filename = format!(
                "verify_{}_{}_{}.png",
                &challenge_id.to_string()[..8],
                chrono::Local::now().format("%Y%m%d_%H%M%S"),
                std::process::id()
            );
            let path = dir.join(filename);
            let annotated = Self::draw_landmarks(&frame, &lm);
            annotated
                .save(&path)
                .map_err(|e| Error::Other(format!("Failed to save debug image: {}", e)))?;
            log::info!("Debug frame saved: {}", path.display());
            return Ok(());
        }

        log::debug!("No face-bearing frame available for debug output");
        Ok(())
    }

    /// Draw the detector-relevant landmarks onto a copy of the frame.
    fn draw_landmarks(frame: &RgbImage, lm: &Landmarks) -> RgbImage {
        // Eye corners, lips, nose tip, brows: the points the detectors read.
        const MARKED: [usize; 11] = [33, 133, 362, 263, 61, 291, 13, 14, 1, 105, 334];

        let mut annotated = frame.clone();
        let (w, h) = annotated.dimensions();
        let red = Rgb([255, 0, 0]);
        for &idx in MARKED.iter() {
            if let Some(p) = lm.get(idx) {
                draw_cross_mut(
                    &mut annotated,
                    red,
                    (p.x * w as f32) as i32,
                    (p.y * h as f32) as i32,
                );
            }
        }
        annotated
    }

    /// Ensure the debug output directory exists, expanding a leading `~`.
    fn ensure_debug_dir(dir: &std::path::Path) -> Result<std::path::PathBuf, Error> {
        let expanded = if dir.starts_with("~") {
            if let Some(home) = std::env::var_os("HOME") {
                std::path::PathBuf::from(home).join(dir.strip_prefix("~").unwrap())
            } else {
                dir.to_path_buf()
            }
        } else {
            dir.to_path_buf()
        };

        std::fs::create_dir_all(&expanded)
            .map_err(|e| Error::Other(format!("Failed to create debug directory: {}", e)))?;

        Ok(expanded)
    }
}
