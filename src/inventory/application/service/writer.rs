//! Writes a rendered [`ClusterInventory`] where the playbook expects it.

use crate::core::domain::{
    error::{FleetError, FleetResult, ValidationError},
    model::inventory::ClusterInventory,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Inventory location inside a checked-out playbook repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryPaths {
    dir: PathBuf,
}

impl InventoryPaths {
    /// `<playbook_root>/inventory/my-cluster`.
    pub fn new(playbook_root: impl AsRef<Path>) -> Self {
        Self {
            dir: playbook_root.as_ref().join("inventory").join("my-cluster"),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn hosts_file(&self) -> PathBuf {
        self.dir.join("hosts.ini")
    }

    #[must_use]
    pub fn variables_file(&self) -> PathBuf {
        self.dir.join("group_vars").join("all.yml")
    }
}

/// Writes `hosts.ini` and `group_vars/all.yml`.
///
/// Each file is written to a sibling temporary file and renamed into place.
/// Files whose content is already identical are left untouched.
///
/// # Errors
/// `FleetError::Io` naming the path that could not be written, or
/// `FleetError::Config` when the variables cannot be serialized.
pub async fn write_inventory(
    inventory: &ClusterInventory,
    paths: &InventoryPaths,
) -> FleetResult<()> {
    let variables = inventory.variables_file().map_err(|e| {
        ValidationError::Format(format!(
            "group variables cannot be serialized: {e}"
        ))
    })?;

    write_if_changed(&paths.hosts_file(), &inventory.hosts_file()).await?;
    write_if_changed(&paths.variables_file(), &variables).await?;

    info!(
        dir = %paths.dir().display(),
        masters = inventory.masters.len(),
        workers = inventory.workers.len(),
        "Inventory written"
    );
    Ok(())
}

async fn write_if_changed(path: &Path, content: &str) -> FleetResult<()> {
    let io_error = |source| FleetError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Ok(existing) = tokio::fs::read_to_string(path).await
        && existing == content
    {
        debug!(path = %path.display(), "Unchanged, not rewriting");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, content)
        .await
        .map_err(io_error)?;
    tokio::fs::rename(&staging, path).await.map_err(io_error)?;
    Ok(())
}
