//! Per-frame recognition pipeline and the database it owns.
//!
//! landmarks → similarity transform → backend warp + inference →
//! L2 normalize → database search. The database sits behind a reader-writer
//! lock: searches share it, enroll/reload take it exclusively. The backend
//! sits behind a mutex so one session serves every caller.

use crate::alignment::{self, AlignmentError};
use crate::config::{ConfigError, DebugMode, EngineConfig};
use crate::database::{DatabaseError, FeatureDatabase};
use crate::enrollment::EnrollmentSource;
use crate::features;
use crate::recognizer::{InferenceBackend, InferenceError};
use crate::types::{Frame, LandmarkSet, MatchResult};
use serde::Serialize;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("alignment error: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("invalid engine config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("backend produces {backend}-dim features but the engine is configured for {configured}")]
    FeatureLenMismatch { backend: usize, configured: usize },
    #[error("engine lock poisoned")]
    LockPoisoned,
}

/// An enrollment sample that was passed over during a reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSample {
    pub label: Option<String>,
    pub reason: String,
}

/// Outcome of [`RecognitionEngine::reload`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadSummary {
    pub ingested: usize,
    /// Identities left out because the database filled up.
    pub dropped: Vec<String>,
    pub skipped: Vec<SkippedSample>,
}

pub struct RecognitionEngine<B: InferenceBackend> {
    backend: Mutex<B>,
    database: RwLock<FeatureDatabase>,
    feature_len: usize,
    debug_mode: DebugMode,
}

impl<B: InferenceBackend> RecognitionEngine<B> {
    /// Build an engine with an empty database sized from `config`.
    pub fn new(backend: B, config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        if backend.feature_len() != config.feature_len {
            return Err(EngineError::FeatureLenMismatch {
                backend: backend.feature_len(),
                configured: config.feature_len,
            });
        }

        tracing::info!(
            capacity = config.max_register_face,
            feature_len = config.feature_len,
            threshold = config.threshold,
            debug_mode = ?config.debug_mode,
            "recognition engine ready"
        );

        Ok(Self {
            backend: Mutex::new(backend),
            database: RwLock::new(FeatureDatabase::new(
                config.max_register_face,
                config.feature_len,
                config.threshold,
            )),
            feature_len: config.feature_len,
            debug_mode: config.debug_mode,
        })
    }

    fn read_db(&self) -> Result<RwLockReadGuard<'_, FeatureDatabase>, EngineError> {
        self.database.read().map_err(|_| EngineError::LockPoisoned)
    }

    fn write_db(&self) -> Result<RwLockWriteGuard<'_, FeatureDatabase>, EngineError> {
        self.database.write().map_err(|_| EngineError::LockPoisoned)
    }

    fn timed<T>(&self, stage: &'static str, f: impl FnOnce() -> T) -> T {
        if self.debug_mode < DebugMode::Timing {
            return f();
        }
        let start = Instant::now();
        let out = f();
        tracing::info!(stage, elapsed_us = start.elapsed().as_micros() as u64, "stage timing");
        out
    }

    /// Align, run inference and L2-normalize: the embedding for one face.
    pub fn extract_feature(&self, frame: &Frame, landmarks: &LandmarkSet) -> Result<Vec<f32>, EngineError> {
        let matrix = self.timed("align", || alignment::estimate_112(landmarks))?;
        if self.debug_mode >= DebugMode::Verbose {
            tracing::debug!(matrix = ?matrix.m, scale = matrix.scale(), "affine matrix");
        }

        let raw = self.timed("inference", || -> Result<Vec<f32>, EngineError> {
            let mut backend = self.backend.lock().map_err(|_| EngineError::LockPoisoned)?;
            Ok(backend.extract(frame, &matrix)?)
        })?;

        if raw.len() != self.feature_len {
            return Err(InferenceError::UnexpectedShape {
                expected: self.feature_len,
                actual: raw.len(),
            }
            .into());
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(InferenceError::NonFiniteOutput.into());
        }
        Ok(features::normalize(&raw))
    }

    /// Identify the face at `landmarks` against the enrolled database.
    pub fn recognize(&self, frame: &Frame, landmarks: &LandmarkSet) -> Result<MatchResult, EngineError> {
        let query = self.extract_feature(frame, landmarks)?;
        let result = self.timed("search", || -> Result<MatchResult, EngineError> {
            Ok(self.read_db()?.search(&query))
        })?;

        if self.debug_mode >= DebugMode::Verbose {
            tracing::debug!(
                id = result.id_or_sentinel(),
                score = result.score,
                name = %result.name,
                "match result"
            );
        }
        Ok(result)
    }

    /// Extract and enroll one face, returning its slot index.
    pub fn enroll(
        &self,
        label: impl Into<String>,
        frame: &Frame,
        landmarks: &LandmarkSet,
    ) -> Result<usize, EngineError> {
        let feature = self.extract_feature(frame, landmarks)?;
        self.enroll_feature(label, &feature)
    }

    /// Enroll a precomputed embedding. It is normalized on the way in.
    pub fn enroll_feature(&self, label: impl Into<String>, feature: &[f32]) -> Result<usize, EngineError> {
        Ok(self.write_db()?.enroll(label, feature)?)
    }

    /// Rebuild the database from `source`, holding the write lock throughout.
    ///
    /// Samples without usable landmarks or with unreadable images are
    /// skipped. Once the database is full the rest of the source is reported
    /// as dropped without running inference on it. An inference failure
    /// aborts the reload; entries ingested before it stay in place.
    pub fn reload(&self, source: &mut dyn EnrollmentSource) -> Result<ReloadSummary, EngineError> {
        let mut db = self.write_db()?;
        let mut skipped = Vec::new();

        let features = std::iter::from_fn(|| loop {
            let sample = match source.next_sample()? {
                Ok(sample) => sample,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable enrollment sample");
                    skipped.push(SkippedSample {
                        label: None,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let Some(landmarks) = sample.landmarks else {
                tracing::warn!(label = %sample.label, "skipping enrollment sample without landmarks");
                skipped.push(SkippedSample {
                    label: Some(sample.label),
                    reason: "no landmarks".to_string(),
                });
                continue;
            };

            match self.extract_feature(&sample.frame, &landmarks) {
                Ok(feature) => return Some(Ok((sample.label, feature))),
                Err(EngineError::Alignment(err)) => {
                    tracing::warn!(label = %sample.label, error = %err, "skipping enrollment sample");
                    skipped.push(SkippedSample {
                        label: Some(sample.label),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Some(Err(err)),
            }
        });

        let ingested = db.reload(features)?;

        let dropped = if db.is_full() {
            source.drain_labels()
        } else {
            Vec::new()
        };
        for label in &dropped {
            tracing::warn!(label = %label, capacity = db.capacity(), "feature database full, identity dropped");
        }

        tracing::info!(
            ingested,
            dropped = dropped.len(),
            skipped = skipped.len(),
            "feature database reloaded"
        );

        Ok(ReloadSummary {
            ingested,
            dropped,
            skipped,
        })
    }

    /// Run `f` against the database under the read lock.
    pub fn with_database<T>(&self, f: impl FnOnce(&FeatureDatabase) -> T) -> Result<T, EngineError> {
        Ok(f(&*self.read_db()?))
    }

    pub fn len(&self) -> Result<usize, EngineError> {
        self.with_database(FeatureDatabase::len)
    }

    pub fn is_empty(&self) -> Result<bool, EngineError> {
        self.with_database(FeatureDatabase::is_empty)
    }

    pub fn labels(&self) -> Result<Vec<String>, EngineError> {
        self.with_database(|db| db.labels().to_vec())
    }

    pub fn capacity(&self) -> Result<usize, EngineError> {
        self.with_database(FeatureDatabase::capacity)
    }

    pub fn threshold(&self) -> Result<f32, EngineError> {
        self.with_database(FeatureDatabase::threshold)
    }

    pub fn feature_len(&self) -> usize {
        self.feature_len
    }

    pub fn debug_mode(&self) -> DebugMode {
        self.debug_mode
    }
}
