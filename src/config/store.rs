use std::path::{Path, PathBuf};

use super::{BoardConfig, ConfigError, Result};

/// The configuration document on local disk
#[derive(Debug, Clone)]
pub struct LocalConfigStore {
    path: PathBuf,
}

impl LocalConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<BoardConfig> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(self.path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&content)?;
        log::debug!("Loaded configuration from {}", self.path.display());
        Ok(config)
    }

    /// Write the whole document, replacing the file atomically.
    pub async fn save(&self, config: &BoardConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(config)?;
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        log::debug!("Saved configuration to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_reported_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalConfigStore::new(dir.path().join("config.json"));
        assert!(matches!(store.load().await, Err(ConfigError::Missing(_))));
    }

    #[tokio::test]
    async fn save_then_load_keeps_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalConfigStore::new(dir.path().join("nested/config.json"));
        let mut config = BoardConfig::default();
        config.id = Some("b-7".to_string());
        config.extra.insert("site".to_string(), serde_json::json!("rooftop"));

        store.save(&config).await.unwrap();
        assert_eq!(store.load().await.unwrap(), config);
    }
}
