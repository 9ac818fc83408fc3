//! Reload controller
//!
//! Owns the on-disk configuration artifacts and the proxy reload trigger.
//! Only artifacts whose content changed since the last successful apply are
//! written, and one reload cycle covers all of them. On reload failure the
//! previous artifact set is restored and stays live; the failure is
//! reported but never retried automatically — the next resource change is
//! the only retry path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crd::ResourceKey;
use crate::error::{Error, Result};

/// Outcome of one apply cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Hosts whose artifact was written this cycle
    pub written: Vec<ResourceKey>,
    /// Hosts whose artifact was already up to date
    pub unchanged: Vec<ResourceKey>,
    /// Whether a proxy reload was performed
    pub reloaded: bool,
}

/// The seam between the reconciliation core and the proxy process.
#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Write the given artifacts and reload the proxy if anything changed.
    async fn apply(&self, artifacts: &[(ResourceKey, Vec<u8>)]) -> Result<ApplyReport>;

    /// Remove a host's artifact entirely. Returns false when there was
    /// nothing to remove.
    async fn delete(&self, key: &ResourceKey) -> Result<bool>;

    /// Write a TLS secret PEM file; returns the file path for use in
    /// rendered configuration.
    async fn write_secret(&self, name: &str, pem: &[u8]) -> Result<String>;
}

// ============================================================================
// Local proxy
// ============================================================================

/// Manages a proxy running next to the controller: config files under
/// `<conf>/conf.d`, secrets under `<conf>/secrets`, reload via the proxy
/// binary's signal interface.
pub struct LocalProxyManager {
    confd_path: PathBuf,
    secrets_path: PathBuf,
    binary: String,
    last_applied: RwLock<HashMap<ResourceKey, Vec<u8>>>,
    config_version: AtomicU64,
}

impl LocalProxyManager {
    pub fn new(conf_path: impl AsRef<Path>, binary: impl Into<String>) -> Result<Self> {
        let conf_path = conf_path.as_ref();
        let confd_path = conf_path.join("conf.d");
        let secrets_path = conf_path.join("secrets");
        std::fs::create_dir_all(&confd_path)?;
        std::fs::create_dir_all(&secrets_path)?;

        Ok(Self {
            confd_path,
            secrets_path,
            binary: binary.into(),
            last_applied: RwLock::new(HashMap::new()),
            config_version: AtomicU64::new(0),
        })
    }

    fn config_filename(&self, key: &ResourceKey) -> PathBuf {
        self.confd_path
            .join(format!("vs_{}_{}.conf", key.namespace, key.name))
    }

    /// Number of reloads performed since startup
    pub fn config_version(&self) -> u64 {
        self.config_version.load(Ordering::SeqCst)
    }

    async fn run_proxy(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.binary).args(args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ReloadFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn reload(&self) -> Result<()> {
        self.run_proxy(&["-t"]).await?;
        self.run_proxy(&["-s", "reload"]).await?;
        self.config_version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, changed: &[(ResourceKey, Option<Vec<u8>>)]) {
        for (key, previous) in changed {
            let filename = self.config_filename(key);
            let result = match previous {
                Some(bytes) => tokio::fs::write(&filename, bytes).await,
                None => tokio::fs::remove_file(&filename).await,
            };
            if let Err(err) = result {
                warn!(file = %filename.display(), error = %err, "rollback failed");
            }
        }
    }
}

#[async_trait]
impl ProxyManager for LocalProxyManager {
    async fn apply(&self, artifacts: &[(ResourceKey, Vec<u8>)]) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut changed: Vec<(ResourceKey, Option<Vec<u8>>)> = Vec::new();

        {
            let last = self.last_applied.read().await;
            for (key, bytes) in artifacts {
                if last.get(key) == Some(bytes) {
                    report.unchanged.push(key.clone());
                } else {
                    changed.push((key.clone(), last.get(key).cloned()));
                }
            }
        }

        if changed.is_empty() {
            debug!("no artifacts changed, skipping reload");
            return Ok(report);
        }

        for (key, _) in &changed {
            let bytes = artifacts
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, b)| b.as_slice())
                .unwrap_or_default();
            tokio::fs::write(self.config_filename(key), bytes).await?;
        }

        if let Err(err) = self.reload().await {
            self.rollback(&changed).await;
            return Err(err);
        }

        let mut last = self.last_applied.write().await;
        for (key, bytes) in artifacts {
            if changed.iter().any(|(k, _)| k == key) {
                last.insert(key.clone(), bytes.clone());
                report.written.push(key.clone());
            }
        }
        report.reloaded = true;

        Ok(report)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        let previous = {
            let mut last = self.last_applied.write().await;
            last.remove(key)
        };

        let filename = self.config_filename(key);
        let existed = tokio::fs::remove_file(&filename).await.is_ok() || previous.is_some();
        if !existed {
            return Ok(false);
        }

        if let Err(err) = self.reload().await {
            if let Some(bytes) = previous {
                self.rollback(&[(key.clone(), Some(bytes.clone()))]).await;
                self.last_applied.write().await.insert(key.clone(), bytes);
            }
            return Err(err);
        }

        Ok(true)
    }

    async fn write_secret(&self, name: &str, pem: &[u8]) -> Result<String> {
        let filename = self.secrets_path.join(name);
        tokio::fs::write(&filename, pem).await?;
        Ok(filename.to_string_lossy().into_owned())
    }
}

// ============================================================================
// Fake proxy for tests
// ============================================================================

/// In-memory ProxyManager with the same change-detection and fail-static
/// semantics as the local one. Reload failures can be injected.
pub struct FakeProxyManager {
    files: RwLock<HashMap<ResourceKey, Vec<u8>>>,
    secrets: RwLock<HashMap<String, Vec<u8>>>,
    reload_count: AtomicU64,
    fail_reloads: AtomicBool,
}

impl FakeProxyManager {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            secrets: RwLock::new(HashMap::new()),
            reload_count: AtomicU64::new(0),
            fail_reloads: AtomicBool::new(false),
        }
    }

    /// Make every subsequent reload fail until cleared
    pub fn set_fail_reloads(&self, fail: bool) {
        self.fail_reloads.store(fail, Ordering::SeqCst);
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_count.load(Ordering::SeqCst)
    }

    /// Artifact currently live for the given host
    pub async fn file(&self, key: &ResourceKey) -> Option<Vec<u8>> {
        self.files.read().await.get(key).cloned()
    }

    pub async fn has_file(&self, key: &ResourceKey) -> bool {
        self.files.read().await.contains_key(key)
    }

    pub async fn secret(&self, name: &str) -> Option<Vec<u8>> {
        self.secrets.read().await.get(name).cloned()
    }
}

impl Default for FakeProxyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProxyManager for FakeProxyManager {
    async fn apply(&self, artifacts: &[(ResourceKey, Vec<u8>)]) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut changed = Vec::new();

        {
            let files = self.files.read().await;
            for (key, bytes) in artifacts {
                if files.get(key) == Some(bytes) {
                    report.unchanged.push(key.clone());
                } else {
                    changed.push((key.clone(), bytes.clone()));
                }
            }
        }

        if changed.is_empty() {
            return Ok(report);
        }

        if self.fail_reloads.load(Ordering::SeqCst) {
            // the previous artifact set stays live
            return Err(Error::ReloadFailed("configuration test failed".to_string()));
        }

        let mut files = self.files.write().await;
        for (key, bytes) in changed {
            files.insert(key.clone(), bytes);
            report.written.push(key);
        }
        self.reload_count.fetch_add(1, Ordering::SeqCst);
        report.reloaded = true;

        Ok(report)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<bool> {
        let mut files = self.files.write().await;
        if !files.contains_key(key) {
            return Ok(false);
        }
        if self.fail_reloads.load(Ordering::SeqCst) {
            return Err(Error::ReloadFailed("configuration test failed".to_string()));
        }
        files.remove(key);
        self.reload_count.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn write_secret(&self, name: &str, pem: &[u8]) -> Result<String> {
        self.secrets
            .write()
            .await
            .insert(name.to_string(), pem.to_vec());
        Ok(format!("/etc/proxy/secrets/{}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name)
    }

    #[tokio::test]
    async fn test_apply_writes_and_reloads() {
        let proxy = FakeProxyManager::new();
        let report = proxy
            .apply(&[(key("cafe"), b"server {}".to_vec())])
            .await
            .unwrap();

        assert!(report.reloaded);
        assert_eq!(report.written, vec![key("cafe")]);
        assert_eq!(proxy.reload_count(), 1);
        assert_eq!(proxy.file(&key("cafe")).await.unwrap(), b"server {}");
    }

    #[tokio::test]
    async fn test_unchanged_content_skips_reload() {
        let proxy = FakeProxyManager::new();
        let artifact = vec![(key("cafe"), b"server {}".to_vec())];
        proxy.apply(&artifact).await.unwrap();

        let report = proxy.apply(&artifact).await.unwrap();
        assert!(!report.reloaded);
        assert_eq!(report.unchanged, vec![key("cafe")]);
        assert_eq!(proxy.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_one_reload_covers_all_changed_hosts() {
        let proxy = FakeProxyManager::new();
        let report = proxy
            .apply(&[
                (key("cafe"), b"a".to_vec()),
                (key("bar"), b"b".to_vec()),
            ])
            .await
            .unwrap();

        assert_eq!(report.written.len(), 2);
        assert_eq!(proxy.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_artifact() {
        let proxy = FakeProxyManager::new();
        proxy
            .apply(&[(key("cafe"), b"good".to_vec())])
            .await
            .unwrap();

        proxy.set_fail_reloads(true);
        let err = proxy
            .apply(&[(key("cafe"), b"broken".to_vec())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReloadFailed(_)));

        // byte-for-byte unchanged
        assert_eq!(proxy.file(&key("cafe")).await.unwrap(), b"good");
        assert_eq!(proxy.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_artifact() {
        let proxy = FakeProxyManager::new();
        proxy
            .apply(&[(key("cafe"), b"server {}".to_vec())])
            .await
            .unwrap();

        assert!(proxy.delete(&key("cafe")).await.unwrap());
        assert!(!proxy.has_file(&key("cafe")).await);
        assert!(!proxy.delete(&key("cafe")).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_manager_paths() {
        let base = std::env::temp_dir().join(format!("routegate-test-{}", std::process::id()));
        let manager = LocalProxyManager::new(&base, "true").unwrap();
        assert_eq!(
            manager.config_filename(&key("cafe")),
            base.join("conf.d").join("vs_default_cafe.conf")
        );

        let path = manager.write_secret("default_cafe-secret", b"pem").await.unwrap();
        assert!(path.ends_with("default_cafe-secret"));
        let _ = std::fs::remove_dir_all(&base);
    }
}
