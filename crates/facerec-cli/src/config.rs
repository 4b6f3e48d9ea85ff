use anyhow::{Context, Result};
use facerec_core::{DebugMode, EngineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration: optional TOML file, overridden by `FACEREC_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the recognition ONNX model.
    pub model_path: PathBuf,
    /// Enrollment directory (`<label>/<image>` or `<label>.<ext>`).
    pub db_dir: PathBuf,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_path: data_dir.join("models").join("w600k_r50.onnx"),
            db_dir: data_dir.join("faces"),
            engine: EngineConfig::default(),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facerec")
}

impl Config {
    /// Load from `path` (if given), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.engine.validate().context("invalid engine settings")?;
        Ok(config)
    }

    /// Override fields from `FACEREC_*` variables; unparsable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEREC_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEREC_DB_DIR") {
            self.db_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse(&lookup, "FACEREC_MAX_REGISTER_FACE") {
            self.engine.max_register_face = v;
        }
        if let Some(v) = env_parse(&lookup, "FACEREC_THRESHOLD") {
            self.engine.threshold = v;
        }
        if let Some(v) = env_parse(&lookup, "FACEREC_FEATURE_LEN") {
            self.engine.feature_len = v;
        }
        if let Some(level) = env_parse::<u8>(&lookup, "FACEREC_DEBUG_MODE") {
            match DebugMode::try_from(level) {
                Ok(mode) => self.engine.debug_mode = mode,
                Err(err) => tracing::warn!(error = %err, "ignoring FACEREC_DEBUG_MODE"),
            }
        }
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("FACEREC_DB_DIR", "/srv/faces"),
            ("FACEREC_MAX_REGISTER_FACE", "25"),
            ("FACEREC_THRESHOLD", "0.55"),
            ("FACEREC_DEBUG_MODE", "2"),
        ]));
        assert_eq!(config.db_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.engine.max_register_face, 25);
        assert_eq!(config.engine.threshold, 0.55);
        assert_eq!(config.engine.debug_mode, DebugMode::Verbose);
        assert_eq!(config.engine.feature_len, 512);
    }

    #[test]
    fn test_invalid_env_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("FACEREC_THRESHOLD", "high"),
            ("FACEREC_DEBUG_MODE", "7"),
        ]));
        assert_eq!(config.engine.threshold, 0.40);
        assert_eq!(config.engine.debug_mode, DebugMode::Off);
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facerec.toml");
        std::fs::write(
            &path,
            "model_path = \"/opt/models/arcface.onnx\"\nmax_register_face = 10\nthreshold = 0.5\ndebug_mode = 1\n",
        )
        .unwrap();

        let config: Config = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.model_path, PathBuf::from("/opt/models/arcface.onnx"));
        assert_eq!(config.engine.max_register_face, 10);
        assert_eq!(config.engine.threshold, 0.5);
        assert_eq!(config.engine.debug_mode, DebugMode::Timing);
    }

    #[test]
    fn test_load_rejects_invalid_engine_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facerec.toml");
        std::fs::write(&path, "max_register_face = 0\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
