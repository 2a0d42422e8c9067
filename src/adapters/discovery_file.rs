use std::path::{Path, PathBuf};

use async_trait::async_trait;
use config::{Config, File};
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    config::loader::file_format,
    ports::discovery::{DiscoveryProvider, DiscoverySnapshot},
};

/// Load a discovery document (rules plus services) from a YAML, JSON or TOML file
pub fn load_snapshot_file(path: &Path) -> Result<DiscoverySnapshot> {
    let name = path
        .to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?;
    Config::builder()
        .add_source(File::new(name, file_format(path)))
        .build()
        .with_context(|| format!("Failed to read discovery file {}", path.display()))?
        .try_deserialize()
        .with_context(|| format!("Failed to parse discovery file {}", path.display()))
}

/// Discovery provider that loads from a local file and watches for changes.
pub struct FileDiscoveryProvider {
    path: PathBuf,
    // Kept alive for as long as the provider; never read.
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    // Taken once by `watch()`.
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileDiscoveryProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1);

        let mut provider = Self {
            path: path.into(),
            _watcher: None,
            update_tx: tx,
            update_rx: Mutex::new(Some(rx)),
        };

        provider.init_watcher()?;
        Ok(provider)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid discovery path: {}", self.path.display()))?
            .to_owned();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let relevant = event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove();
                        if relevant && event.paths.iter().any(|p| p.file_name() == Some(&file_name)) {
                            tracing::debug!(kind = ?event.kind, "Discovery file changed");
                            // A pending signal already covers this change.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        let watch_dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch discovery directory")?;

        self._watcher = Some(watcher);
        Ok(())
    }
}

#[async_trait]
impl DiscoveryProvider for FileDiscoveryProvider {
    async fn load_snapshot(&self) -> Result<DiscoverySnapshot> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_snapshot_file(&path))
            .await
            .wrap_err("Discovery load task failed")?
    }

    /// Hands out the change channel. Later calls get an already-closed one.
    fn watch(&self) -> mpsc::Receiver<()> {
        match self.update_rx.lock().take() {
            Some(rx) => rx,
            None => {
                tracing::warn!("Discovery watch channel already taken");
                mpsc::channel(1).1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::tempdir;
    use tokio::time::{Duration, sleep};

    use super::*;
    use crate::core::model::FlowControlType;

    const INITIAL: &str = r#"
rules:
  - id: "user-rule"
    service_id: "user"
    prefix: "/user"
    paths: ["/user/info"]
    retry_config:
      times: 2
    filter_configs:
      - id: "load_balance_filter"
        config: '{"load_balance": "RoundRobin"}'
    flow_control_configs:
      - type: "path"
        value: "/user/info"
        algorithm: "fixed_window"
        config: '{"duration": 1, "permits": 10}'
services:
  - definition:
      unique_id: "user:1.0"
      service_id: "user"
      version: "1.0"
    instances:
      - instance_id: "10.0.0.1:8080"
        unique_id: "user:1.0"
        ip: "10.0.0.1"
        port: 8080
"#;

    #[test]
    fn test_load_snapshot_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("discovery.yaml");
        File::create(&file_path)?.write_all(INITIAL.as_bytes())?;

        let snapshot = load_snapshot_file(&file_path)?;
        assert_eq!(snapshot.rules.len(), 1);
        let rule = &snapshot.rules[0];
        assert_eq!(rule.retry_config.times, 2);
        assert_eq!(rule.flow_control_configs[0].kind, FlowControlType::Path);
        assert_eq!(snapshot.services[0].instances[0].port, 8080);
        assert!(snapshot.services[0].instances[0].enable);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_discovery_provider_watch() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("discovery.yaml");
        File::create(&file_path)?.write_all(INITIAL.as_bytes())?;

        let provider = FileDiscoveryProvider::new(&file_path)?;
        assert_eq!(provider.load_snapshot().await?.services.len(), 1);

        let mut rx = provider.watch();
        sleep(Duration::from_millis(100)).await;
        File::create(&file_path)?.write_all(b"rules: []\nservices: []\n")?;

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for discovery update");

        let snapshot = provider.load_snapshot().await?;
        assert!(snapshot.services.is_empty());
        Ok(())
    }
}
