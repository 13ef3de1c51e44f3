//! Hot reload of the listener file.
//!
//! Every write to the file triggers a re-read; configurations that load
//! cleanly are pushed onto a channel for the runtime to apply as a new
//! generation. An edit that fails to load leaves the running listeners
//! untouched.

use std::path::Path;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;

/// Watch `path` and emit each successfully loaded configuration.
///
/// The returned watcher handle must be kept alive; dropping it stops the
/// watch and closes the update channel.
pub fn watch_config(
    path: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<ProxyConfig>), notify::Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watched = path.to_path_buf();

    let mut watcher =
        notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "listener file watch error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            match load_config(&watched) {
                Ok(config) => {
                    tracing::info!(
                        path = %watched.display(),
                        listeners = config.len(),
                        "listener file reloaded"
                    );
                    let _ = tx.send(config);
                }
                Err(err) => {
                    tracing::warn!(
                        path = %watched.display(),
                        error = %err,
                        "listener file edit rejected, active set unchanged"
                    );
                }
            }
        })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;

    tracing::info!(path = %path.display(), "watching listener file");
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "mcp-trace-proxy-watch-{}-{:x}.json",
            std::process::id(),
            crate::telemetry::now_ms()
        ))
    }

    const VALID: &str =
        r#"{"api": {"type": "openapi", "host": "localhost", "port": 3000, "target_port": 13000}}"#;

    #[tokio::test]
    async fn test_rewrite_emits_new_config_and_garbage_does_not() {
        let path = temp_path();
        std::fs::write(&path, VALID).unwrap();

        let (_guard, mut updates) = watch_config(&path).unwrap();

        std::fs::write(&path, "{not json").unwrap();
        std::fs::write(&path, VALID).unwrap();

        // garbage writes are dropped; the valid rewrite must come through
        let config = tokio::time::timeout(Duration::from_secs(10), updates.recv())
            .await
            .expect("no reload arrived")
            .unwrap();
        assert!(config.contains_key("api"));

        std::fs::remove_file(&path).ok();
    }
}
