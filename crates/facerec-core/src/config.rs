use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recognizer::ARCFACE_EMBEDDING_DIM;

/// Largest feature arena (in `f32` elements, 1 GiB) an engine will allocate.
pub const MAX_ARENA_LEN: usize = 1 << 28;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_register_face must be at least 1")]
    ZeroCapacity,
    #[error("feature_len must be at least 1")]
    ZeroFeatureLen,
    #[error("threshold {0} is outside the cosine range [-1, 1]")]
    ThresholdOutOfRange(f32),
    #[error("feature arena of {capacity} x {feature_len} exceeds {max} elements")]
    ArenaTooLarge {
        capacity: usize,
        feature_len: usize,
        max: usize,
    },
    #[error("debug mode must be 0, 1 or 2, got {0}")]
    InvalidDebugMode(u8),
}

/// Engine diagnostics level.
///
/// `Timing` logs per-stage latency; `Verbose` additionally logs the affine
/// matrix and every match result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DebugMode {
    #[default]
    Off,
    Timing,
    Verbose,
}

impl TryFrom<u8> for DebugMode {
    type Error = ConfigError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::Off),
            1 => Ok(Self::Timing),
            2 => Ok(Self::Verbose),
            other => Err(ConfigError::InvalidDebugMode(other)),
        }
    }
}

impl From<DebugMode> for u8 {
    fn from(mode: DebugMode) -> u8 {
        mode as u8
    }
}

/// Construction parameters for a [`RecognitionEngine`](crate::RecognitionEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the feature database.
    pub max_register_face: usize,
    /// Minimum cosine similarity for a positive match.
    pub threshold: f32,
    /// Embedding length produced by the recognition model.
    pub feature_len: usize,
    pub debug_mode: DebugMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_register_face: 100,
            threshold: 0.40,
            feature_len: ARCFACE_EMBEDDING_DIM,
            debug_mode: DebugMode::Off,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_register_face == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.feature_len == 0 {
            return Err(ConfigError::ZeroFeatureLen);
        }
        match self.max_register_face.checked_mul(self.feature_len) {
            Some(len) if len <= MAX_ARENA_LEN => {}
            _ => {
                return Err(ConfigError::ArenaTooLarge {
                    capacity: self.max_register_face,
                    feature_len: self.feature_len,
                    max: MAX_ARENA_LEN,
                })
            }
        }
        if !(-1.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let base = EngineConfig::default();
        let zero_cap = EngineConfig { max_register_face: 0, ..base.clone() };
        let zero_len = EngineConfig { feature_len: 0, ..base.clone() };
        let bad_thresh = EngineConfig { threshold: 1.5, ..base.clone() };
        let nan_thresh = EngineConfig { threshold: f32::NAN, ..base };
        assert_eq!(zero_cap.validate(), Err(ConfigError::ZeroCapacity));
        assert_eq!(zero_len.validate(), Err(ConfigError::ZeroFeatureLen));
        assert_eq!(bad_thresh.validate(), Err(ConfigError::ThresholdOutOfRange(1.5)));
        assert!(nan_thresh.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_arena() {
        let overflow = EngineConfig {
            max_register_face: usize::MAX,
            feature_len: 512,
            ..EngineConfig::default()
        };
        assert!(matches!(overflow.validate(), Err(ConfigError::ArenaTooLarge { .. })));

        let huge = EngineConfig {
            max_register_face: MAX_ARENA_LEN / 512 + 1,
            ..EngineConfig::default()
        };
        assert!(matches!(huge.validate(), Err(ConfigError::ArenaTooLarge { .. })));

        let at_limit = EngineConfig {
            max_register_face: MAX_ARENA_LEN / 512,
            ..EngineConfig::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_debug_mode_levels() {
        assert_eq!(DebugMode::try_from(2), Ok(DebugMode::Verbose));
        assert_eq!(DebugMode::try_from(3), Err(ConfigError::InvalidDebugMode(3)));
        assert!(DebugMode::Verbose > DebugMode::Timing);
        assert_eq!(u8::from(DebugMode::Timing), 1);
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"threshold": 0.6, "debug_mode": 1}"#).unwrap();
        assert_eq!(cfg.threshold, 0.6);
        assert_eq!(cfg.debug_mode, DebugMode::Timing);
        assert_eq!(cfg.max_register_face, 100);
    }
}
