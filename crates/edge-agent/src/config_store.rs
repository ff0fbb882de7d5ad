//! # Configuration Store
//!
//! Shared in-memory copy of the three configuration documents.
//!
//! The configuration service is the only writer. Every other service reads a cloned
//! snapshot when it needs one, so a reader never holds the lock across an await.
//! Documents are replaced whole on reload, one document at a time; a reader that takes
//! snapshots of two documents during a reload may see one old and one new.
//!
//! A failed load never clears a document: the previous value (the zero value before the
//! first successful load) stays in place.

use crate::error::ConfigError;
use crate::messages::{AgentMessage, ConfigChange};
use crate::model::{Asset, Connectivity, Equipment};
use crate::settings::AgentSettings;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// The three documents the agent loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigDocument {
    Asset,
    Equipment,
    Connectivity,
}

impl ConfigDocument {
    pub const ALL: [ConfigDocument; 3] = [
        ConfigDocument::Asset,
        ConfigDocument::Equipment,
        ConfigDocument::Connectivity,
    ];

    /// The bus message announcing a change to this document.
    pub fn change_message(self, change: ConfigChange) -> AgentMessage {
        match self {
            ConfigDocument::Asset => AgentMessage::AssetChanged(change),
            ConfigDocument::Equipment => AgentMessage::EquipmentChanged(change),
            ConfigDocument::Connectivity => AgentMessage::ConnectivityChanged(change),
        }
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConfigDocument::Asset => "asset",
            ConfigDocument::Equipment => "equipment",
            ConfigDocument::Connectivity => "connectivity",
        };
        f.write_str(label)
    }
}

/// Where each document lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub dir: PathBuf,
    pub asset: PathBuf,
    pub equipment: PathBuf,
    pub connectivity: PathBuf,
}

impl ConfigPaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let defaults = AgentSettings::default();
        Self {
            asset: dir.join(defaults.asset_file),
            equipment: dir.join(defaults.equipment_file),
            connectivity: dir.join(defaults.connectivity_file),
            dir,
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            dir: settings.config_dir.clone(),
            asset: settings.asset_path(),
            equipment: settings.equipment_path(),
            connectivity: settings.connectivity_path(),
        }
    }

    pub fn path(&self, document: ConfigDocument) -> &Path {
        match document {
            ConfigDocument::Asset => &self.asset,
            ConfigDocument::Equipment => &self.equipment,
            ConfigDocument::Connectivity => &self.connectivity,
        }
    }

    /// Which document, if any, `path` refers to.
    pub fn document_for(&self, path: &Path) -> Option<ConfigDocument> {
        ConfigDocument::ALL.into_iter().find(|document| {
            let known = self.path(*document);
            known == path || (known.file_name().is_some() && known.file_name() == path.file_name())
        })
    }
}

#[derive(Debug, Default)]
struct Documents {
    asset: Asset,
    equipment: Equipment,
    connectivity: Connectivity,
}

/// Cheap to clone; all clones share the same documents.
#[derive(Clone, Default)]
pub struct ConfigStore {
    documents: Arc<RwLock<Documents>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asset(&self) -> Asset {
        self.documents.read().asset.clone()
    }

    pub fn equipment(&self) -> Equipment {
        self.documents.read().equipment.clone()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.documents.read().connectivity.clone()
    }

    pub fn set_asset(&self, asset: Asset) {
        self.documents.write().asset = asset;
    }

    pub fn set_equipment(&self, equipment: Equipment) {
        self.documents.write().equipment = equipment;
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.documents.write().connectivity = connectivity;
    }

    /// Reloads one document from `path`. On error the previous value is kept.
    pub async fn load(&self, document: ConfigDocument, path: &Path) -> Result<(), ConfigError> {
        match document {
            ConfigDocument::Asset => self.set_asset(load_json(path).await?),
            ConfigDocument::Equipment => self.set_equipment(load_json(path).await?),
            ConfigDocument::Connectivity => self.set_connectivity(load_json(path).await?),
        }
        debug!(%document, path = %path.display(), "Configuration loaded");
        Ok(())
    }

    /// Loads all three documents independently; failures are logged and skipped.
    pub async fn load_all(&self, paths: &ConfigPaths) {
        for document in ConfigDocument::ALL {
            let path = paths.path(document);
            if let Err(e) = self.load(document, path).await {
                warn!(%document, path = %path.display(), error = %e, "Configuration load failed; keeping previous");
            }
        }
    }
}

pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::EmptyPath);
    }
    let bytes = tokio::fs::read(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
