use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use lifesign_core::config::Config;
use lifesign_core::matcher::VerifyOutcome;
use lifesign_core::store::FileStore;
use lifesign_core::{ClientInfo, Verifier};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "lifesign")]
#[command(about = "Challenge-response liveness verification", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new single-use gesture challenge
    Challenge,
    /// Verify a sequence of frames against a challenge
    Verify {
        /// Challenge ID to verify against
        #[arg(short, long)]
        challenge: Uuid,
        /// Image files, in capture order
        frames: Vec<PathBuf>,
        /// Print the raw outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline against the fixed attack-simulation sequence
    AttackSim {
        /// Image files of the simulated attack (e.g. a photo held to camera)
        frames: Vec<PathBuf>,
        /// Print the raw outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show configuration
    Config {
        /// Validate configuration
        #[arg(long)]
        validate: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Challenge => cmd_challenge(),
        Commands::Verify {
            challenge,
            frames,
            json,
        } => cmd_verify(challenge, frames, json),
        Commands::AttackSim { frames, json } => cmd_attack_sim(frames, json),
        Commands::Config { validate } => cmd_config(validate),
    }
}

fn make_verifier() -> anyhow::Result<Verifier> {
    let config = Config::load()?;
    let store = Arc::new(FileStore::new(&config.storage.base_path));
    Ok(Verifier::new(config, store))
}

fn cmd_challenge() -> anyhow::Result<()> {
    let verifier = make_verifier()?;
    let challenge = verifier.generate_challenge()?;

    println!("Challenge ID: {}", challenge.id);
    println!(
        "Expires: {} ({}s from now)",
        challenge.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
        challenge.expires_in_seconds(chrono::Utc::now())
    );
    println!();
    println!("Perform these gestures in order, on camera:");
    for (i, step) in challenge.steps.iter().enumerate() {
        println!("  {}. {} ({})", i + 1, step.instruction(), step);
    }

    Ok(())
}

fn cmd_verify(challenge_id: Uuid, frame_paths: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    if frame_paths.is_empty() {
        anyhow::bail!("Provide at least one frame file");
    }

    let verifier = make_verifier()?;
    let frames = encode_frames(&frame_paths)?;

    println!(
        "Verifying {} frames against challenge {}...",
        frames.len(),
        challenge_id
    );

    let client = ClientInfo {
        ip_address: None,
        user_agent: Some(format!("lifesign-cli/{}", env!("CARGO_PKG_VERSION"))),
    };
    let report = verifier.verify(challenge_id, &frames, client)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.outcome)?);
        return Ok(());
    }

    println!();
    print_outcome(&report.outcome);

    if let Some(credential) = report.credential {
        println!();
        println!("✓ Verified live. Credential (expires {}):", credential.expires_at);
        println!("{}", credential.token);
    } else {
        println!();
        println!("✗ Verification failed");
    }

    Ok(())
}

fn cmd_attack_sim(frame_paths: Vec<PathBuf>, json: bool) -> anyhow::Result<()> {
    if frame_paths.is_empty() {
        anyhow::bail!("Provide at least one frame file");
    }

    let verifier = make_verifier()?;
    let frames = encode_frames(&frame_paths)?;

    println!("Running attack simulation over {} frames...", frames.len());

    let report = verifier.attack_sim(&frames)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.outcome)?);
        println!("Rejection reason: {}", report.rejection_reason);
        return Ok(());
    }

    println!();
    print_outcome(&report.outcome);
    println!();
    println!("Rejection reason: {}", report.rejection_reason);
    println!("{}", report.recommendation);

    Ok(())
}

fn cmd_config(validate: bool) -> anyhow::Result<()> {
    let config = Config::load()?;

    if validate {
        config.validate()?;
        println!("✓ Configuration is valid");
        return Ok(());
    }

    println!("Configuration:");
    println!();

    println!("[vision]");
    println!("  frame_width = {}", config.vision.frame_width);
    println!(
        "  min_consecutive_frames = {}",
        config.vision.min_consecutive_frames
    );
    println!("  max_frames = {}", config.vision.max_frames);
    println!();

    println!("[detector]");
    println!("  ear_threshold = {}", config.detector.ear_threshold);
    println!(
        "  smile_ratio_threshold = {}",
        config.detector.smile_ratio_threshold
    );
    println!(
        "  mouth_open_threshold = {}",
        config.detector.mouth_open_threshold
    );
    println!(
        "  brow_raise_threshold = {}",
        config.detector.brow_raise_threshold
    );
    println!("  head_turn_nose_x = {}", config.detector.head_turn_nose_x);
    println!();

    println!("[mesh]");
    println!("  model = {:?}", config.mesh.model_path);
    println!(
        "  min_face_confidence = {}",
        config.mesh.min_face_confidence
    );
    println!();

    println!("[challenge]");
    println!("  expiry_seconds = {}", config.challenge.expiry_seconds);
    println!("  length = {}", config.challenge.length);
    println!();

    println!("[token]");
    println!("  ttl_seconds = {}", config.token.ttl_seconds);
    println!();

    println!("[storage]");
    println!("  base_path = {:?}", config.storage.base_path);
    println!();

    println!("[debug]");
    println!("  save_frames = {}", config.debug.save_frames);
    println!("  output_dir = {:?}", config.debug.output_dir);

    Ok(())
}

/// Read image files and wrap them as base64 payloads, in argument order.
fn encode_frames(paths: &[PathBuf]) -> anyhow::Result<Vec<String>> {
    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read frame {:?}: {}", path, e))?;
        frames.push(BASE64_STANDARD.encode(&bytes));
        log::debug!("Encoded frame {:?} ({} bytes)", path, bytes.len());
    }
    Ok(frames)
}

fn print_outcome(outcome: &VerifyOutcome) {
    println!(
        "{:<12} {:<10} {:<12} {}",
        "Step", "Detected", "Confidence", "Frame"
    );
    println!("{}", "-".repeat(48));
    for result in &outcome.step_results {
        println!(
            "{:<12} {:<10} {:<12.3} {}",
            result.step.to_string(),
            if result.detected { "yes" } else { "no" },
            result.confidence,
            if result.frame_idx >= 0 {
                result.frame_idx.to_string()
            } else {
                "—".to_string()
            }
        );
    }
    println!();
    println!("Liveness score: {:.1} / 100", outcome.liveness_score);
    println!(
        "Face presence:  {} of {} frames",
        outcome.face_detected_count, outcome.total_frames
    );
    println!("Temporal order: {}", if outcome.temporal_valid { "valid" } else { "invalid" });
}
