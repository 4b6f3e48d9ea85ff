//! Fixed-capacity feature database with nearest-match cosine search.
//!
//! Embeddings live in a single `capacity × feature_len` arena allocated at
//! construction; enrollment copies a normalized vector into the next slot and
//! a reload overwrites the arena in place.

use crate::features::{cosine, normalize_in_place};
use crate::types::MatchResult;
use thiserror::Error;

/// Score reported when searching an empty database.
pub const EMPTY_DATABASE_SCORE: f32 = 0.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatabaseError {
    #[error("feature database is full ({capacity} faces), '{label}' was not enrolled")]
    CapacityExceeded { capacity: usize, label: String },
    #[error("feature length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("feature for '{label}' contains NaN or infinite values")]
    NonFinite { label: String },
}

/// Borrowed view of one enrolled face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatabaseEntry<'a> {
    pub slot: usize,
    pub label: &'a str,
    pub feature: &'a [f32],
}

pub struct FeatureDatabase {
    arena: Vec<f32>,
    labels: Vec<String>,
    capacity: usize,
    feature_len: usize,
    threshold: f32,
}

impl FeatureDatabase {
    /// Allocate the arena up front.
    ///
    /// Sizes come from a validated [`EngineConfig`](crate::EngineConfig);
    /// `capacity * feature_len` must not overflow.
    pub fn new(capacity: usize, feature_len: usize, threshold: f32) -> Self {
        Self {
            arena: vec![0.0; capacity * feature_len],
            labels: Vec::with_capacity(capacity),
            capacity,
            feature_len,
            threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.labels.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn feature_len(&self) -> usize {
        self.feature_len
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn label(&self, slot: usize) -> Option<&str> {
        self.labels.get(slot).map(String::as_str)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Normalized feature stored in `slot`.
    pub fn feature(&self, slot: usize) -> Option<&[f32]> {
        (slot < self.len()).then(|| self.slot_range(slot)).map(|r| &self.arena[r])
    }

    /// Enrolled entries in insertion (slot) order.
    pub fn entries(&self) -> impl Iterator<Item = DatabaseEntry<'_>> {
        self.labels.iter().enumerate().map(move |(slot, label)| DatabaseEntry {
            slot,
            label,
            feature: &self.arena[self.slot_range(slot)],
        })
    }

    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        slot * self.feature_len..(slot + 1) * self.feature_len
    }

    /// Drop every entry. The arena keeps its allocation.
    pub fn clear(&mut self) {
        self.labels.clear();
        self.arena.fill(0.0);
    }

    /// Normalize `vector` and store it under `label` in the next slot.
    ///
    /// Returns the assigned slot index. A full database, or a vector with
    /// NaN or infinite components, rejects the entry and stays unchanged.
    pub fn enroll(&mut self, label: impl Into<String>, vector: &[f32]) -> Result<usize, DatabaseError> {
        let label = label.into();
        if vector.len() != self.feature_len {
            return Err(DatabaseError::DimensionMismatch {
                expected: self.feature_len,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(DatabaseError::NonFinite { label });
        }
        if self.is_full() {
            return Err(DatabaseError::CapacityExceeded {
                capacity: self.capacity,
                label,
            });
        }

        let slot = self.labels.len();
        let range = self.slot_range(slot);
        let dst = &mut self.arena[range];
        dst.copy_from_slice(vector);
        normalize_in_place(dst);
        self.labels.push(label);

        tracing::debug!(slot, label = %self.labels[slot], "enrolled face");
        Ok(slot)
    }

    /// Clear the database and rebuild it from `features`.
    ///
    /// Items are pulled lazily and only while there is room, so a producer
    /// that runs inference per item does no work past capacity. Returns the
    /// number of entries ingested, or the first error the producer yields.
    pub fn reload<I, E>(&mut self, features: I) -> Result<usize, E>
    where
        I: IntoIterator<Item = Result<(String, Vec<f32>), E>>,
        E: From<DatabaseError>,
    {
        self.clear();
        let mut features = features.into_iter();
        while !self.is_full() {
            let Some(item) = features.next() else {
                break;
            };
            let (label, vector) = item?;
            self.enroll(label, &vector)?;
        }
        Ok(self.len())
    }

    /// Find the enrolled face closest to `query` (already normalized).
    ///
    /// Single linear scan in slot order; on equal scores the lowest slot
    /// wins. Below the threshold the result is "unknown" but still carries
    /// the best score observed.
    pub fn search(&self, query: &[f32]) -> MatchResult {
        if query.len() != self.feature_len {
            tracing::warn!(
                expected = self.feature_len,
                actual = query.len(),
                "query feature length mismatch"
            );
            return MatchResult::unknown(EMPTY_DATABASE_SCORE);
        }

        let mut best_score = f32::NEG_INFINITY;
        let mut best_slot: Option<usize> = None;

        for entry in self.entries() {
            let score = cosine(query, entry.feature);
            if score > best_score {
                best_score = score;
                best_slot = Some(entry.slot);
            }
        }

        match best_slot {
            Some(slot) if best_score >= self.threshold => MatchResult {
                id: Some(slot),
                score: best_score,
                name: self.labels[slot].clone(),
            },
            Some(_) => MatchResult::unknown(best_score),
            None => MatchResult::unknown(EMPTY_DATABASE_SCORE),
        }
    }
}

impl std::fmt::Debug for FeatureDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureDatabase")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("feature_len", &self.feature_len)
            .field("threshold", &self.threshold)
            .finish()
    }
}
