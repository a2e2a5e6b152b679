//! Disk registry: named, configured driver instances.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use stowage_common::{Error, Result, StoragePath};

use crate::buffer::BufferDriver;
use crate::driver::StorageDriver;
use crate::dropbox::{DropboxConfig, DropboxDriver};
use crate::ftp::{FtpConfig, FtpDriver};
use crate::gdrive::{GDriveConfig, GDriveDriver};
use crate::local::{LocalConfig, LocalDriver};
use crate::readonly::ReadOnlyDriver;
use crate::s3::{S3Config, S3Driver};
use crate::scoped::ScopedDriver;
use crate::sftp::{SftpConfig, SftpDriver};
use crate::temporary::LinkRequest;

/// Backend selection for one disk, tagged by `driver`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum StorageDiskConfig {
    Local(LocalConfig),
    Buffer,
    S3(S3Config),
    Ftp(FtpConfig),
    Sftp(SftpConfig),
    Dropbox(DropboxConfig),
    Gdrive(GDriveConfig),
    /// Another disk restricted to `prefix`.
    Scoped { disk: String, prefix: String },
}

impl StorageDiskConfig {
    /// The `driver` tag.
    pub fn driver_name(&self) -> &'static str {
        match self {
            StorageDiskConfig::Local(_) => "local",
            StorageDiskConfig::Buffer => "buffer",
            StorageDiskConfig::S3(_) => "s3",
            StorageDiskConfig::Ftp(_) => "ftp",
            StorageDiskConfig::Sftp(_) => "sftp",
            StorageDiskConfig::Dropbox(_) => "dropbox",
            StorageDiskConfig::Gdrive(_) => "gdrive",
            StorageDiskConfig::Scoped { .. } => "scoped",
        }
    }
}

/// One disk entry of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(flatten)]
    pub config: StorageDiskConfig,
    /// Wrap the driver in a `ReadOnlyDriver`.
    #[serde(default)]
    pub read_only: bool,
}

impl From<StorageDiskConfig> for DiskConfig {
    fn from(config: StorageDiskConfig) -> Self {
        Self {
            config,
            read_only: false,
        }
    }
}

/// The whole storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Default disk name. May be omitted when exactly one disk exists.
    #[serde(default)]
    pub default: Option<String>,
    pub disks: BTreeMap<String, DiskConfig>,
}

impl StorageConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    /// - File missing or unreadable
    /// - Malformed JSON or unknown `driver` tag
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Name of the default disk, if it can be determined.
    fn default_name(&self) -> Result<Option<String>> {
        match &self.default {
            Some(name) if !self.disks.contains_key(name) => Err(Error::InvalidInput(format!(
                "Default disk '{}' is not configured",
                name
            ))),
            Some(name) => Ok(Some(name.clone())),
            None if self.disks.len() == 1 => Ok(self.disks.keys().next().cloned()),
            None => Ok(None),
        }
    }
}

/// A disk name bound to its constructed driver.
#[derive(Clone)]
pub struct StorageDisk {
    pub name: String,
    pub config: DiskConfig,
    pub driver: Arc<dyn StorageDriver>,
    /// Local driver backing this disk, directly or through a scoped chain.
    /// Temporary links issued on the disk resolve against it.
    local: Option<Arc<LocalDriver>>,
}

impl StorageDisk {
    /// Wrap an already constructed driver.
    pub fn new(name: impl Into<String>, config: DiskConfig, driver: Arc<dyn StorageDriver>) -> Self {
        Self {
            name: name.into(),
            config,
            driver,
            local: None,
        }
    }
}

impl fmt::Debug for StorageDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDisk")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("driver", &self.driver.name())
            .field("local", &self.local.as_ref().map(|local| local.root().to_path_buf()))
            .finish()
    }
}

/// A validated temporary link.
pub struct ResolvedLink {
    /// Driver holding the linked content.
    pub driver: Arc<dyn StorageDriver>,
    /// Path on `driver`.
    pub path: StoragePath,
}

/// Maps disk names to driver instances.
///
/// Every disk is constructed once, when the registry is built; calls on a
/// disk go straight to its driver with no per-call dispatch on the config.
/// Scoped disks hold the driver of the disk they wrap, read-only wrapping
/// included.
pub struct DiskRegistry {
    default: Option<String>,
    disks: HashMap<String, StorageDisk>,
}

impl fmt::Debug for DiskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskRegistry")
            .field("default", &self.default)
            .field("disks", &self.names())
            .finish()
    }
}

impl DiskRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            default: None,
            disks: HashMap::new(),
        }
    }

    /// Construct every configured disk.
    ///
    /// # Errors
    /// - A backend rejected its configuration
    /// - The default disk is not configured
    /// - A scoped disk refers to a missing disk or forms a cycle
    pub async fn build(config: StorageConfig) -> Result<Self> {
        let default = config.default_name()?;
        let mut disks = HashMap::new();

        for (name, disk) in &config.disks {
            if matches!(disk.config, StorageDiskConfig::Scoped { .. }) {
                continue;
            }
            disks.insert(name.clone(), build_backend(name, disk).await?);
        }

        let mut registry = Self { default, disks };
        let scoped: Vec<(String, DiskConfig)> = config
            .disks
            .into_iter()
            .filter(|(_, disk)| matches!(disk.config, StorageDiskConfig::Scoped { .. }))
            .collect();
        registry.link_scoped(scoped)?;

        info!(disks = registry.disks.len(), default = ?registry.default, "Disk registry built");
        Ok(registry)
    }

    /// Build scoped disks once the disks they wrap exist.
    ///
    /// Each pass builds every scoped disk whose target is ready; a pass
    /// that makes no progress means a missing target or a cycle.
    fn link_scoped(&mut self, mut pending: Vec<(String, DiskConfig)>) -> Result<()> {
        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();

            for (name, disk) in pending {
                let target = match &disk.config {
                    StorageDiskConfig::Scoped { disk: target, .. } => target.clone(),
                    _ => continue,
                };
                match self.disks.get(&target) {
                    Some(inner) => {
                        let built = build_scoped(&name, &disk, inner)?;
                        self.disks.insert(name, built);
                    }
                    None => waiting.push((name, disk)),
                }
            }

            if waiting.len() == before {
                let names: Vec<&str> = waiting.iter().map(|(name, _)| name.as_str()).collect();
                return Err(Error::InvalidInput(format!(
                    "Scoped disks refer to missing disks or form a cycle: {}",
                    names.join(", ")
                )));
            }
            pending = waiting;
        }
        Ok(())
    }

    /// Look up a disk.
    ///
    /// # Errors
    /// - `NotFound` if no disk has this name
    pub fn disk(&self, name: &str) -> Result<&StorageDisk> {
        self.disks
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Disk '{}' is not configured", name)))
    }

    /// Driver of the disk `name`.
    pub fn driver(&self, name: &str) -> Result<Arc<dyn StorageDriver>> {
        Ok(self.disk(name)?.driver.clone())
    }

    /// The default disk.
    ///
    /// # Errors
    /// - `InvalidInput` if no default is configured and several disks exist
    pub fn default_disk(&self) -> Result<&StorageDisk> {
        match &self.default {
            Some(name) => self.disk(name),
            None => Err(Error::InvalidInput(
                "No default disk configured".to_string(),
            )),
        }
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Disk names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.disks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Add a disk built elsewhere.
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is taken
    pub fn insert(&mut self, disk: StorageDisk) -> Result<()> {
        if self.disks.contains_key(&disk.name) {
            return Err(Error::AlreadyExists(format!(
                "Disk '{}' is already configured",
                disk.name
            )));
        }
        if self.disks.is_empty() && self.default.is_none() {
            self.default = Some(disk.name.clone());
        }
        debug!(disk = %disk.name, "Disk inserted");
        self.disks.insert(disk.name.clone(), disk);
        Ok(())
    }

    /// Rebuild the disk `name` from `config`, replacing the old entry
    /// wholesale. Scoped disks are re-linked so that they wrap the new
    /// driver.
    ///
    /// # Errors
    /// - `NotFound` if no disk has this name
    /// - The new configuration could not be built
    pub async fn replace(&mut self, name: &str, config: DiskConfig) -> Result<()> {
        self.disk(name)?;
        let snapshot = self.disks.clone();

        let disk = match &config.config {
            StorageDiskConfig::Scoped { disk: target, .. } => {
                let inner = self.disk(target)?;
                build_scoped(name, &config, inner)?
            }
            _ => build_backend(name, &config).await?,
        };
        self.disks.insert(name.to_string(), disk);

        let scoped: Vec<(String, DiskConfig)> = self
            .disks
            .values()
            .filter(|d| d.name != name)
            .filter(|d| matches!(d.config.config, StorageDiskConfig::Scoped { .. }))
            .map(|d| (d.name.clone(), d.config.clone()))
            .collect();
        for (scoped_name, _) in &scoped {
            self.disks.remove(scoped_name);
        }
        if let Err(e) = self.link_scoped(scoped) {
            self.disks = snapshot;
            return Err(e);
        }

        info!(disk = %name, driver = config.config.driver_name(), "Disk replaced");
        Ok(())
    }

    /// Validate a temporary link issued on the disk `disk`.
    ///
    /// Returns `Ok(None)` for unknown, expired or mismatched tokens, without
    /// saying which.
    ///
    /// # Errors
    /// - `NotFound` if the disk does not exist
    /// - `Unsupported` if the disk is not backed by a local driver
    pub async fn resolve_temporary_link(
        &self,
        disk: &str,
        token: &str,
        request: &LinkRequest,
    ) -> Result<Option<ResolvedLink>> {
        let entry = self.disk(disk)?;
        let local = entry
            .local
            .as_ref()
            .ok_or_else(|| Error::unsupported(entry.driver.name(), "temporary link resolution"))?;

        Ok(local
            .resolve_temporary_link(token, request)
            .await
            .map(|path| ResolvedLink {
                driver: local.clone(),
                path,
            }))
    }
}

impl Default for DiskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Construct a non-scoped disk.
async fn build_backend(name: &str, disk: &DiskConfig) -> Result<StorageDisk> {
    let mut local = None;
    let driver: Arc<dyn StorageDriver> = match &disk.config {
        StorageDiskConfig::Local(config) => {
            let driver = Arc::new(LocalDriver::new(config.clone())?);
            local = Some(driver.clone());
            driver
        }
        StorageDiskConfig::Buffer => Arc::new(BufferDriver::new()),
        StorageDiskConfig::S3(config) => Arc::new(S3Driver::connect(config.clone()).await?),
        StorageDiskConfig::Ftp(config) => Arc::new(FtpDriver::new(config.clone())?),
        StorageDiskConfig::Sftp(config) => Arc::new(SftpDriver::new(config.clone())?),
        StorageDiskConfig::Dropbox(config) => Arc::new(DropboxDriver::new(config.clone())?),
        StorageDiskConfig::Gdrive(config) => Arc::new(GDriveDriver::new(config.clone())?),
        StorageDiskConfig::Scoped { .. } => {
            return Err(Error::InvalidInput(format!(
                "Disk '{}' is scoped and needs its target built first",
                name
            )))
        }
    };

    info!(disk = %name, driver = disk.config.driver_name(), read_only = disk.read_only, "Disk built");
    Ok(StorageDisk {
        name: name.to_string(),
        config: disk.clone(),
        driver: wrap_read_only(driver, disk.read_only),
        local,
    })
}

fn build_scoped(name: &str, disk: &DiskConfig, inner: &StorageDisk) -> Result<StorageDisk> {
    let prefix = match &disk.config {
        StorageDiskConfig::Scoped { prefix, .. } => prefix,
        _ => {
            return Err(Error::InvalidInput(format!(
                "Disk '{}' is not scoped",
                name
            )))
        }
    };
    let driver = Arc::new(ScopedDriver::with_prefix(inner.driver.clone(), prefix)?);

    info!(disk = %name, wraps = %inner.name, prefix = %prefix, "Scoped disk built");
    Ok(StorageDisk {
        name: name.to_string(),
        config: disk.clone(),
        driver: wrap_read_only(driver, disk.read_only),
        local: inner.local.clone(),
    })
}

fn wrap_read_only(driver: Arc<dyn StorageDriver>, read_only: bool) -> Arc<dyn StorageDriver> {
    if read_only {
        Arc::new(ReadOnlyDriver::new(driver))
    } else {
        driver
    }
}
