//! Engine configuration loading.
//!
//! Reads `EngineConfig` from a TOML file. A missing or malformed file is not
//! an error: the engine falls back to defaults and logs why.

use std::path::Path;

use conveyor_types::config::EngineConfig;

/// Default configuration file name looked up by the CLI.
pub const CONFIG_FILE_NAME: &str = "conveyor.toml";

/// Load engine configuration from `path`, falling back to defaults.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::config::RetryStrategy;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&tmp.path().join(CONFIG_FILE_NAME)).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn valid_toml_is_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
step_timeout_secs = 5
global_timeout_secs = 60

[retry]
strategy = "exponential"
max_retries = 4
delay_ms = 100
max_delay_ms = 1000

[log]
level = "debug"
json = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.global_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.retry.strategy, RetryStrategy::Exponential);
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[tokio::test]
    async fn malformed_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "step_timeout_secs = \"soon\"").await.unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config, EngineConfig::default());
    }
}
