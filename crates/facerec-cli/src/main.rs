use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facerec_core::alignment;
use facerec_core::enrollment::load_face_image;
use facerec_core::{BoundingBox, DirectorySource, LandmarkSet, MatchResult, OnnxRecognizer, RecognitionEngine};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

use config::Config;

/// Padding around the landmark hull when reporting a face box.
const BOX_MARGIN: f32 = 0.35;

#[derive(Parser)]
#[command(name = "facerec", about = "Face alignment and feature database matching")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate the alignment transform for five landmarks
    Align {
        /// Five "x,y" pairs: left eye, right eye, nose, left mouth, right mouth
        #[arg(short, long)]
        landmarks: String,
    },
    /// List the identities in an enrollment directory
    List {
        /// Enrollment directory (defaults to the configured one)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Build the feature database from an enrollment directory
    Enroll {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Identify the face in each probe image
    Identify {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Probe images (landmarks from `<stem>.json`, or 112×112 pre-aligned crops)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

type Engine = RecognitionEngine<OnnxRecognizer>;

#[derive(Serialize)]
struct AlignReport {
    matrix: [[f32; 3]; 2],
    flat: [f32; 6],
    scale: f32,
    rotation_det: f32,
}

#[derive(Serialize)]
struct EntryReport<'a> {
    slot: usize,
    label: &'a str,
}

#[derive(Serialize)]
struct ProbeReport {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bbox: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<MatchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_landmarks(text: &str) -> Result<LandmarkSet> {
    let points = text
        .split_whitespace()
        .map(|pair| -> Result<(f32, f32)> {
            let (x, y) = pair
                .split_once(',')
                .with_context(|| format!("expected \"x,y\", got {pair:?}"))?;
            Ok((x.trim().parse::<f32>()?, y.trim().parse::<f32>()?))
        })
        .collect::<Result<Vec<_>>>()?;

    let count = points.len();
    points
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 5 landmarks, got {count}"))
}

fn build_engine(config: &Config, db: &Path) -> Result<(Arc<Engine>, facerec_core::ReloadSummary)> {
    let recognizer = OnnxRecognizer::load(&config.model_path_str(), config.engine.feature_len)?;
    let engine = RecognitionEngine::new(recognizer, &config.engine)?;

    let mut source = DirectorySource::open(db)?;
    let summary = engine.reload(&mut source)?;
    Ok((Arc::new(engine), summary))
}

fn identify_one(engine: &Engine, path: &Path) -> Result<ProbeReport> {
    let (frame, landmarks) = load_face_image(path)?;
    let Some(landmarks) = landmarks else {
        bail!("no landmarks for {} (add a .json sidecar or use a 112x112 crop)", path.display());
    };
    let result = engine.recognize(&frame, &landmarks)?;
    Ok(ProbeReport {
        image: path.display().to_string(),
        bbox: Some(BoundingBox::around_landmarks(&landmarks, BOX_MARGIN)),
        caption: Some(result.overlay_text()),
        result: Some(result),
        error: None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Align { landmarks } => {
            let landmarks = parse_landmarks(&landmarks)?;
            let m = alignment::estimate_112(&landmarks)?;
            let report = AlignReport {
                matrix: m.m,
                flat: m.to_array(),
                scale: m.scale(),
                rotation_det: m.rotation_det(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::List { db } => {
            let db = db.unwrap_or_else(|| config.db_dir.clone());
            let source = DirectorySource::open(&db)?;
            for label in source.labels() {
                println!("{label}");
            }
        }
        Commands::Enroll { db } => {
            let db = db.unwrap_or_else(|| config.db_dir.clone());
            let (engine, summary) = build_engine(&config, &db)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            let entries = engine.with_database(|database| {
                database
                    .entries()
                    .map(|e| serde_json::to_string(&EntryReport { slot: e.slot, label: e.label }))
                    .collect::<Result<Vec<_>, _>>()
            })??;
            for entry in entries {
                println!("{entry}");
            }
        }
        Commands::Identify { db, images } => {
            let db = db.unwrap_or_else(|| config.db_dir.clone());
            let (engine, summary) = build_engine(&config, &db)?;
            tracing::info!(
                enrolled = summary.ingested,
                dropped = summary.dropped.len(),
                probes = images.len(),
                "database ready"
            );

            let tasks: Vec<_> = images
                .into_iter()
                .map(|path| {
                    let engine = Arc::clone(&engine);
                    tokio::task::spawn_blocking(move || {
                        identify_one(&engine, &path).unwrap_or_else(|err| ProbeReport {
                            image: path.display().to_string(),
                            bbox: None,
                            caption: None,
                            result: None,
                            error: Some(format!("{err:#}")),
                        })
                    })
                })
                .collect();

            for task in tasks {
                let report = task.await.context("probe task panicked")?;
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_landmarks() {
        let lm = parse_landmarks("38.3,51.7 73.5,51.5 56.0,71.7 41.5,92.4 70.7,92.2").unwrap();
        assert_eq!(lm[0], (38.3, 51.7));
        assert_eq!(lm[4], (70.7, 92.2));
    }

    #[test]
    fn test_parse_landmarks_wrong_count() {
        let err = parse_landmarks("1,2 3,4").unwrap_err();
        assert!(err.to_string().contains("expected 5 landmarks"), "{err}");
    }

    #[test]
    fn test_parse_landmarks_malformed() {
        assert!(parse_landmarks("1,2 3,4 5 6,7 8,9").is_err());
        assert!(parse_landmarks("1,2 3,4 x,6 6,7 8,9").is_err());
    }

    #[test]
    fn test_cli_parses_identify() {
        let cli = Cli::try_parse_from(["facerec", "identify", "--db", "/tmp/faces", "a.png", "b.png"]).unwrap();
        match cli.command {
            Commands::Identify { db, images } => {
                assert_eq!(db, Some(PathBuf::from("/tmp/faces")));
                assert_eq!(images.len(), 2);
            }
            _ => panic!("expected identify"),
        }
    }
}
