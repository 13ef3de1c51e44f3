//! Configuration loading from disk.

use std::path::Path;

use crate::config::schema::ProxyConfig;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Load a proxy configuration from a JSON file.
///
/// Each listener's `name` defaults to its mapping key.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config: ProxyConfig = serde_json::from_str(&content)?;
    for (key, listener) in config.iter_mut() {
        if listener.name.is_none() {
            listener.name = Some(key.clone());
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProxyKind;
    use std::io::Write;

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mcp-trace-proxy-config-{}-{:x}.json",
            std::process::id(),
            crate::telemetry::now_ms()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_config_defaults_name_to_key() {
        let path = write_temp(
            r#"{
                "playwright": {
                    "type": "mcp_sse",
                    "host": "localhost",
                    "port": "8931",
                    "target_port": 18931
                },
                "search": {
                    "type": "mcp_http",
                    "host": "127.0.0.1",
                    "port": 3001,
                    "target_port": "13001",
                    "name": "custom"
                }
            }"#,
        );
        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let playwright = &config["playwright"];
        assert_eq!(playwright.name.as_deref(), Some("playwright"));
        assert_eq!(playwright.kind, ProxyKind::McpSse);
        assert_eq!(playwright.port, 8931);

        assert_eq!(config["search"].name.as_deref(), Some("custom"));
    }

    #[test]
    fn test_load_config_rejects_bad_schema() {
        let path = write_temp(r#"{"bad": {"type": "mcp_sse", "host": "localhost"}}"#);
        let result = load_config(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/config.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
