//! Loading the server configuration from its TOML file.

use std::path::Path;

use crate::domain::config::{ConfigError, ServerConfig};

/// Reads, parses and validates the configuration at `path`.
///
/// A missing file yields the defaults, which then fail validation unless the
/// shared secret is supplied some other way.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML, and any error from
/// [`ServerConfig::validate`].
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<ServerConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServerConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// A unique path under the system temp dir, removed on drop.
    struct TempFile(PathBuf);

    impl TempFile {
        fn with_content(content: &str) -> Self {
            let path = std::env::temp_dir().join(format!("regapweb-{}.toml", uuid::Uuid::new_v4()));
            std::fs::write(&path, content).unwrap();
            Self(path)
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_load_config_reads_file() {
        let file = TempFile::with_content(
            "ping_interval_secs = 3\n[tcp_server]\nsecret = \"s\"\nbind_addr = \"127.0.0.1:9000\"\n",
        );

        let config = load_config(&file.0).unwrap();

        assert_eq!(config.ping_interval_secs, 3);
        assert_eq!(config.tcp_server.secret, "s");
        assert_eq!(
            config.tcp_server.bind_addr().unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults_then_validates() {
        let path = std::env::temp_dir().join("regapweb-does-not-exist.toml");

        let err = load_config(&path).unwrap_err();

        assert!(matches!(err, ConfigError::MissingSecret));
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let file = TempFile::with_content("ping_interval_secs = \"ten\"");

        let err = load_config(&file.0).unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_directory_is_an_io_error() {
        let err = load_config(&std::env::temp_dir()).unwrap_err();

        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
