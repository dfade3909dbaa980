use lookout_core::{Backend, DistanceMetric, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("bad value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl std::str::FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusKind::Session),
            "system" => Ok(BusKind::System),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by `LOOKOUT_CONFIG`,
/// then `LOOKOUT_*` environment variables (highest precedence).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory where enrolled photos are kept.
    pub photo_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Embedding extractor implementation.
    pub backend: Backend,
    pub metric: DistanceMetric,
    /// Default distance threshold for searches.
    pub threshold: f32,
    pub bus: BusKind,
}

/// Keys accepted in the TOML file. All optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    photo_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    backend: Option<Backend>,
    metric: Option<DistanceMetric>,
    threshold: Option<f32>,
    bus: Option<BusKind>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match env("LOOKOUT_CONFIG") {
            Some(path) => Some(read_file(Path::new(&path))?),
            None => None,
        };
        Self::from_sources(file, env)
    }

    fn defaults(get: &impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("lookout");

        Self {
            db_path: data_dir.join("registry.db"),
            photo_dir: data_dir.join("photos"),
            model_dir: data_dir.join("models"),
            backend: Backend::Onnx,
            metric: DistanceMetric::Euclidean,
            threshold: DEFAULT_THRESHOLD,
            bus: BusKind::Session,
        }
    }

    fn from_sources(
        file: Option<FileConfig>,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(&get);

        if let Some(file) = file {
            config.db_path = file.db_path.unwrap_or(config.db_path);
            config.photo_dir = file.photo_dir.unwrap_or(config.photo_dir);
            config.model_dir = file.model_dir.unwrap_or(config.model_dir);
            config.backend = file.backend.unwrap_or(config.backend);
            config.metric = file.metric.unwrap_or(config.metric);
            config.threshold = file.threshold.unwrap_or(config.threshold);
            config.bus = file.bus.unwrap_or(config.bus);
        }

        if let Some(v) = get("LOOKOUT_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("LOOKOUT_PHOTO_DIR") {
            config.photo_dir = PathBuf::from(v);
        }
        if let Some(v) = get("LOOKOUT_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("LOOKOUT_BACKEND") {
            config.backend = parse("LOOKOUT_BACKEND", &v)?;
        }
        if let Some(v) = get("LOOKOUT_METRIC") {
            config.metric = parse("LOOKOUT_METRIC", &v)?;
        }
        if let Some(v) = get("LOOKOUT_THRESHOLD") {
            config.threshold = parse("LOOKOUT_THRESHOLD", &v)?;
        }
        if let Some(v) = get("LOOKOUT_BUS") {
            config.bus = parse("LOOKOUT_BUS", &v)?;
        }

        if !config.threshold.is_finite() {
            return Err(ConfigError::Invalid {
                key: "threshold",
                reason: "must be a finite number".into(),
            });
        }

        Ok(config)
    }

    /// Embedding dimensionality implied by the configured backend.
    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
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
    fn test_defaults_under_xdg_data_home() {
        let config = Config::from_sources(None, env(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/lookout/registry.db"));
        assert_eq!(config.photo_dir, PathBuf::from("/data/lookout/photos"));
        assert_eq!(config.backend, Backend::Onnx);
        assert_eq!(config.threshold, DEFAULT_THRESHOLD);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.dimension(), 512);
    }

    #[test]
    fn test_home_fallback() {
        let config = Config::from_sources(None, env(&[("HOME", "/home/ana")])).unwrap();
        assert_eq!(
            config.model_dir,
            PathBuf::from("/home/ana/.local/share/lookout/models")
        );
    }

    #[test]
    fn test_file_then_env_precedence() {
        let file: FileConfig = toml::from_str(
            r#"
            backend = "histogram"
            metric = "cosine"
            threshold = 0.3
            db_path = "/srv/lookout.db"
            "#,
        )
        .unwrap();

        let config = Config::from_sources(
            Some(file),
            env(&[("HOME", "/h"), ("LOOKOUT_THRESHOLD", "0.45")]),
        )
        .unwrap();

        assert_eq!(config.backend, Backend::Histogram);
        assert_eq!(config.metric, DistanceMetric::Cosine);
        assert_eq!(config.db_path, PathBuf::from("/srv/lookout.db"));
        assert!((config.threshold - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("camera = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let err = Config::from_sources(None, env(&[("LOOKOUT_BACKEND", "dlib")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LOOKOUT_BACKEND", .. }));

        let err = Config::from_sources(None, env(&[("LOOKOUT_THRESHOLD", "NaN")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "threshold", .. }));
    }

    #[test]
    fn test_read_file_missing() {
        let err = read_file(Path::new("/nonexistent/lookout.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
