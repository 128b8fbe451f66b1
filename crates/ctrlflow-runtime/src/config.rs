//! Runtime configuration (ctrlflow.toml format).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Root runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Fault signal translation.
    #[serde(default)]
    pub signals: SignalConfig,

    /// Un-recovered panic reporting.
    #[serde(default)]
    pub panic: PanicConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Install the fault handlers when the configuration is applied.
    #[serde(default)]
    pub catch: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicConfig {
    /// Capture a backtrace for un-recovered panics even when
    /// `RUST_BACKTRACE` is unset.
    #[serde(default)]
    pub backtrace: bool,
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| RuntimeError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Make this configuration the process-wide one.
    pub fn apply(&self) -> Result<()> {
        crate::panic::set_force_backtrace(self.panic.backtrace);

        if self.signals.catch {
            crate::signal::enable()?;
        } else if crate::signal::is_enabled() {
            crate::signal::disable()?;
        }

        log::debug!("applied runtime config: {self:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[signals]
catch = true

[panic]
backtrace = true
        "#;

        let config = RuntimeConfig::from_toml(toml).unwrap();

        assert!(config.signals.catch);
        assert!(config.panic.backtrace);
    }

    #[test]
    fn test_missing_sections_default_off() {
        let config = RuntimeConfig::from_toml("[panic]\n").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_reject_wrong_type() {
        let err = RuntimeConfig::from_toml("[signals]\ncatch = \"yes\"\n").unwrap_err();
        assert!(matches!(err, RuntimeError::ParseToml(_)));
    }

    #[test]
    fn test_effective_config_as_toml() {
        let mut config = RuntimeConfig::default();
        config.signals.catch = true;

        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("[signals]\ncatch = true"), "{text}");
        assert!(text.contains("[panic]\nbacktrace = false"), "{text}");
        assert_eq!(RuntimeConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[panic]\nbacktrace = true").unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert!(config.panic.backtrace);
        assert!(!config.signals.catch);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let err = RuntimeConfig::from_file(&path).unwrap_err();
        match err {
            RuntimeError::ReadConfig { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
