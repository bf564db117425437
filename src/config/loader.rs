//! Configuration file loading.

use crate::config::{validate_config, Config};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Load configuration from a YAML file, then validate it.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let yaml = r#"
listen: "127.0.0.1:4242"
assignment_file: /tmp/metlb-assignments.csv
hosts:
  - host: ingest-1
    tcp_port: 4243
  - host: ingest-2
    tcp_port: 4243
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.hosts.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/metlb.yaml");
        assert!(matches!(result.unwrap_err(), ConfigError::Read(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"listen: [not a socket addr").unwrap();

        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_load_invalid_config() {
        // Parses but fails validation: no hosts.
        let yaml = r#"
listen: "127.0.0.1:4242"
assignment_file: /tmp/metlb-assignments.csv
hosts: []
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::Validation(_)));
    }
}
