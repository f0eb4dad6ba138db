use crate::errors::{ErrorKind, FfiError, Result};
use crate::interop::marshal::HostNumerics;
use crate::logging::{self, LogConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Session settings, every field optional in TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub numerics: HostNumerics,

    /// Surface enum values as their constant names
    #[serde(default = "default_false")]
    pub symbolic_enums: bool,

    /// Capacity of the signature-keyed call descriptor cache
    #[serde(default = "default_cache")]
    pub descriptor_cache: usize,

    /// Libraries opened as symbol resolvers when the session starts
    #[serde(default)]
    pub libraries: Vec<String>,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default)]
    pub file: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            numerics: HostNumerics::default(),
            symbolic_enums: false,
            descriptor_cache: default_cache(),
            libraries: Vec::new(),
            logging: LoggingSection::default(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
        }
    }
}

fn default_false() -> bool { false }
fn default_cache() -> usize { 64 }
fn default_level() -> String { "info".to_string() }

fn config_error(message: impl Into<String>) -> FfiError {
    FfiError::new(ErrorKind::Config {
        message: message.into(),
    })
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| config_error(format!("failed to read {}: {}", path.display(), e)))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| config_error(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let bits = self.numerics.integer_bits;
        if bits == 0 || bits > 64 {
            return Err(config_error(format!(
                "numerics.integer_bits must be in 1..=64, got {}",
                bits
            )));
        }
        if self.descriptor_cache == 0 {
            return Err(config_error("descriptor_cache must be non-zero"));
        }
        if logging::parse_level(&self.logging.level).is_none() {
            return Err(config_error(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        Ok(())
    }

    /// Logging settings for `logging::init_with_config`
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: logging::parse_level(&self.logging.level).unwrap_or(tracing::Level::INFO),
            log_path: self.logging.file.clone(),
            json_format: self.logging.json,
            show_spans: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.numerics.integer_bits, 64);
        assert_eq!(config.descriptor_cache, 64);
    }

    #[test]
    fn test_parse_sections() {
        let config = SessionConfig::from_toml_str(
            r#"
            symbolic_enums = true
            descriptor_cache = 8
            libraries = ["libm.so.6"]

            [numerics]
            integer_bits = 53

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();
        assert!(config.symbolic_enums);
        assert_eq!(config.numerics.integer_bits, 53);
        assert_eq!(config.libraries, vec!["libm.so.6".to_string()]);
        assert_eq!(config.log_config().level, tracing::Level::DEBUG);
        assert!(config.log_config().json_format);
    }

    #[test]
    fn test_validation() {
        let err = SessionConfig::from_toml_str("[numerics]\ninteger_bits = 65").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Config { .. }));
        assert!(SessionConfig::from_toml_str("descriptor_cache = 0").is_err());
        assert!(SessionConfig::from_toml_str("[logging]\nlevel = \"chatty\"").is_err());
        assert!(SessionConfig::from_toml_str("descriptor_cache = \"many\"").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "symbolic_enums = true").unwrap();
        let config = SessionConfig::from_file(file.path()).unwrap();
        assert!(config.symbolic_enums);

        assert!(SessionConfig::from_file(Path::new("/nonexistent/cffi.toml")).is_err());
    }
}
