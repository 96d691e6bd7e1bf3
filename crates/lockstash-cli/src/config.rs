use lockstash_cache::CacheConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of a `lockstash.toml` file.
///
/// ```toml
/// [cache]
/// dir = "/var/cache/lockstash"
/// prefix = "rc"
/// max_size_mb = 2048
///
/// [logging]
/// level = "debug"
/// json = false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockstashConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "warn".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" | "none" => "off".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::WARN.into())
        })
    }

    /// The effective filter: the configured level with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Toml { path: String, message: String },
}

impl LockstashConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|err: toml::de::Error| ConfigError::Toml {
            path: path.display().to_string(),
            message: err.message().to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cache_and_logging_tables() {
        let config: LockstashConfig = toml::from_str(
            r#"
            [cache]
            dir = "/var/cache/lockstash"
            prefix = "rc"
            max_size_mb = 2048

            [logging]
            level = "Debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config.cache,
            CacheConfig::new("/var/cache/lockstash", "rc", 2048)
        );
        assert!(config.logging.json);
        assert_eq!(
            LoggingConfig::normalize_level_directives(&config.logging.level),
            "debug"
        );
    }

    #[test]
    fn missing_tables_use_defaults() {
        let config: LockstashConfig = toml::from_str("[cache]\nprefix = \"rc\"\n").unwrap();
        assert_eq!(config.cache.prefix, "rc");
        assert_eq!(config.cache.max_size_mb, 0);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<LockstashConfig>("[cache]\nsize = 1\n").is_err());
        assert!(toml::from_str::<LockstashConfig>("[metrics]\n").is_err());
    }

    #[test]
    fn load_reports_the_path_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lockstash.toml");
        std::fs::write(&path, "[cache\n").unwrap();

        let err = LockstashConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
        assert!(err.to_string().contains("lockstash.toml"));

        let missing = LockstashConfig::load_from_path(tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
