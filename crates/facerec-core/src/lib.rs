//! facerec-core: face alignment and feature-database matching.
//!
//! Five facial landmarks are aligned to the canonical ArcFace template with a
//! closed-form Umeyama similarity transform, an [`InferenceBackend`] turns the
//! aligned crop into an embedding, and a fixed-capacity [`FeatureDatabase`]
//! finds the nearest enrolled identity by cosine similarity.

pub mod alignment;
pub mod config;
pub mod database;
pub mod engine;
pub mod enrollment;
pub mod features;
pub mod recognizer;
pub mod types;

pub use config::{DebugMode, EngineConfig};
pub use database::FeatureDatabase;
pub use engine::{EngineError, RecognitionEngine, ReloadSummary};
pub use enrollment::{DirectorySource, EnrollmentSource, VecSource};
pub use recognizer::{InferenceBackend, OnnxRecognizer};
pub use types::{AffineMatrix, BoundingBox, Frame, LandmarkSet, MatchResult};
