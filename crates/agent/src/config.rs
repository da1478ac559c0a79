use std::path::Path;

use anyhow::{Context, Result};
use sharecast_protocol::ShareConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sharecast/agent.toml";

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<ShareConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(ShareConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ShareConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Log every validation issue. Returns `false` if any of them is an error.
pub fn report_issues(config: &ShareConfig) -> bool {
    let Err(issues) = config.validate() else {
        return true;
    };
    let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{}", issue);
        } else {
            tracing::warn!("{}", issue);
        }
    }
    if has_errors {
        tracing::error!(
            "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
            issues.len()
        );
    }
    !has_errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sharecast-config-{}-{name}", std::process::id()))
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = load_config(&temp_path("absent.toml")).unwrap();
        assert_eq!(config.capture.width, 480);
        assert_eq!(config.signaling.max_message_size, 65_536);
    }

    #[test]
    fn file_values_are_loaded() {
        let path = temp_path("agent.toml");
        std::fs::write(
            &path,
            "[signaling]\nurl = \"ws://10.0.0.5:8080/ws\"\n\n[capture]\nframerate = 30\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.signaling.url, "ws://10.0.0.5:8080/ws");
        assert_eq!(config.capture.framerate, 30);
        assert_eq!(config.capture.height, 960);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let path = temp_path("broken.toml");
        std::fs::write(&path, "[capture\nwidth = ").unwrap();
        assert!(load_config(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn report_issues_blocks_only_on_errors() {
        assert!(report_issues(&ShareConfig::default()));

        let mut warn_only = ShareConfig::default();
        warn_only.ice.turn_urls = vec!["turn:turn.example.com:3478".to_string()];
        assert!(report_issues(&warn_only));

        let mut broken = ShareConfig::default();
        broken.capture.framerate = 0;
        assert!(!report_issues(&broken));
    }
}
