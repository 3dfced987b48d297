//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;
use crate::geometry::Geometry;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Runtime parameters for building an index.
#[derive(Debug, Clone)]
pub struct IndexConfiguration {
    /// Number of physical chapter slots in the volume ring.
    pub chapters_per_volume: u32,
    /// Index pages at the front of each chapter.
    pub index_pages_per_chapter: u32,
    /// Record pages following the index pages.
    pub record_pages_per_chapter: u32,
    /// Chunk records per record page.
    pub records_per_page: u32,
    /// Trailing sparse window size; zero makes the index dense.
    pub sparse_chapters_per_volume: u32,
    /// Delta lists summarized by a chapter's index pages.
    pub delta_lists_per_chapter: u32,
    /// One in this many names is a sample; ignored for dense indexes.
    pub sparse_sample_rate: u32,
    /// Chapters the sparse cache keeps resident.
    pub sparse_cache_capacity: usize,
}

impl Default for IndexConfiguration {
    fn default() -> Self {
        Self {
            chapters_per_volume: 1024,
            index_pages_per_chapter: 16,
            record_pages_per_chapter: 256,
            records_per_page: 256,
            sparse_chapters_per_volume: 0,
            delta_lists_per_chapter: 2048,
            sparse_sample_rate: 32,
            sparse_cache_capacity: 8,
        }
    }
}

impl IndexConfiguration {
    /// Build the validated geometry this configuration describes.
    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(
            self.chapters_per_volume,
            self.index_pages_per_chapter,
            self.record_pages_per_chapter,
            self.records_per_page,
            self.sparse_chapters_per_volume,
            self.delta_lists_per_chapter,
        )
    }

    /// Whether the configured geometry has a sparse window.
    pub fn is_sparse(&self) -> bool {
        self.sparse_chapters_per_volume > 0
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxidedupConfig {
    /// Index geometry and sampling.
    pub index: Option<IndexSpec>,
}

/// `[index]` section overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexSpec {
    /// Chapter slots in the volume ring.
    pub chapters_per_volume: Option<u32>,
    /// Index pages per chapter.
    pub index_pages_per_chapter: Option<u32>,
    /// Record pages per chapter.
    pub record_pages_per_chapter: Option<u32>,
    /// Records per record page.
    pub records_per_page: Option<u32>,
    /// Sparse window size.
    pub sparse_chapters_per_volume: Option<u32>,
    /// Delta lists per chapter.
    pub delta_lists_per_chapter: Option<u32>,
    /// Sampling rate for sparse indexes.
    pub sparse_sample_rate: Option<u32>,
    /// Sparse cache capacity in chapters.
    pub sparse_cache_capacity: Option<usize>,
}

impl IndexSpec {
    fn apply_to(&self, config: &mut IndexConfiguration) {
        if let Some(value) = self.chapters_per_volume {
            config.chapters_per_volume = value;
        }
        if let Some(value) = self.index_pages_per_chapter {
            config.index_pages_per_chapter = value;
        }
        if let Some(value) = self.record_pages_per_chapter {
            config.record_pages_per_chapter = value;
        }
        if let Some(value) = self.records_per_page {
            config.records_per_page = value;
        }
        if let Some(value) = self.sparse_chapters_per_volume {
            config.sparse_chapters_per_volume = value;
        }
        if let Some(value) = self.delta_lists_per_chapter {
            config.delta_lists_per_chapter = value;
        }
        if let Some(value) = self.sparse_sample_rate {
            config.sparse_sample_rate = value;
        }
        if let Some(value) = self.sparse_cache_capacity {
            config.sparse_cache_capacity = value;
        }
    }
}

impl OxidedupConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXIDEDUP_CONFIG` env var (if set), then
    /// apply `OXIDEDUP__index__field` overrides.
    pub fn load_from_env() -> std::result::Result<Self, ConfigError> {
        let config_path = env::var("OXIDEDUP_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> std::result::Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXIDEDUP__") {
                continue;
            }
            let path = key["OXIDEDUP__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["index", "chapters_per_volume"] => {
                    self.index_mut().chapters_per_volume = Some(parse_value(&key, &value)?);
                }
                ["index", "index_pages_per_chapter"] => {
                    self.index_mut().index_pages_per_chapter = Some(parse_value(&key, &value)?);
                }
                ["index", "record_pages_per_chapter"] => {
                    self.index_mut().record_pages_per_chapter = Some(parse_value(&key, &value)?);
                }
                ["index", "records_per_page"] => {
                    self.index_mut().records_per_page = Some(parse_value(&key, &value)?);
                }
                ["index", "sparse_chapters_per_volume"] => {
                    self.index_mut().sparse_chapters_per_volume = Some(parse_value(&key, &value)?);
                }
                ["index", "delta_lists_per_chapter"] => {
                    self.index_mut().delta_lists_per_chapter = Some(parse_value(&key, &value)?);
                }
                ["index", "sparse_sample_rate"] => {
                    self.index_mut().sparse_sample_rate = Some(parse_value(&key, &value)?);
                }
                ["index", "sparse_cache_capacity"] => {
                    self.index_mut().sparse_cache_capacity = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Build an `IndexConfiguration` using defaults plus overrides.
    pub fn to_index_configuration(&self) -> IndexConfiguration {
        let mut config = IndexConfiguration::default();
        if let Some(index) = &self.index {
            index.apply_to(&mut config);
        }
        config
    }

    fn index_mut(&mut self) -> &mut IndexSpec {
        if self.index.is_none() {
            self.index = Some(IndexSpec::default());
        }
        self.index.as_mut().expect("index config")
    }
}

fn parse_value<T: std::str::FromStr>(
    key: &str,
    value: &str,
) -> std::result::Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_geometry_is_valid() {
        let config = IndexConfiguration::default();
        assert!(config.geometry().is_ok());
        assert!(!config.is_sparse());
    }

    #[test]
    fn test_toml_overrides() {
        let parsed: OxidedupConfig = toml::from_str(
            r#"
            [index]
            chapters_per_volume = 64
            sparse_chapters_per_volume = 8
            sparse_sample_rate = 16
            "#,
        )
        .unwrap();
        let config = parsed.to_index_configuration();
        assert_eq!(config.chapters_per_volume, 64);
        assert_eq!(config.sparse_chapters_per_volume, 8);
        assert_eq!(config.sparse_sample_rate, 16);
        // Unset fields keep their defaults.
        assert_eq!(config.records_per_page, 256);
        assert!(config.is_sparse());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIDEDUP__index__chapters_per_volume", "128");
        env::set_var("OXIDEDUP__index__records_per_page", "8");

        let mut config = OxidedupConfig::default();
        let result = config.apply_env_overrides();

        env::remove_var("OXIDEDUP__index__chapters_per_volume");
        env::remove_var("OXIDEDUP__index__records_per_page");

        result.unwrap();
        let index = config.index.unwrap();
        assert_eq!(index.chapters_per_volume, Some(128));
        assert_eq!(index.records_per_page, Some(8));
    }

    #[test]
    fn test_env_override_rejects_bad_value() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIDEDUP__index__chapters_per_volume", "many");
        let mut config = OxidedupConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("OXIDEDUP__index__chapters_per_volume");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_env_override_rejects_unknown_key() {
        let _guard = ENV_LOCK.lock().unwrap();

        env::set_var("OXIDEDUP__index__page_count", "4");
        let mut config = OxidedupConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("OXIDEDUP__index__page_count");

        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let result = OxidedupConfig::load_from_path("/nonexistent/config.toml");
        assert!(result.is_err());
    }
}
