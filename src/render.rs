//! Rendering of the Patroni configuration which depends on the upgrade.
//!
//! Patroni reads member tags from its configuration. The `nosync` tag keeps a member from
//! being chosen as a synchronous standby, which is how units below the published minimum
//! ordinal step out of synchronous replication while the rest of the cluster is replaced.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::upgrade::ConfigRenderer;

/// The rendered tags document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagsDocument {
    pub tags: Tags,
}

/// Patroni member tags controlled by the agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tags {
    pub nosync: bool,
}

/// A `ConfigRenderer` which writes the member tags to a YAML file.
pub struct TagsFileRenderer {
    path: PathBuf,
}

impl TagsFileRenderer {
    /// Create a new instance writing to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigRenderer for TagsFileRenderer {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_config(&self, no_sync: bool) -> Result<()> {
        let rendered = render_tags(no_sync)?;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(current) if current == rendered => return Ok(()),
            Ok(_) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err).with_context(|| format!("error reading {:?}", self.path)),
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("error creating directory {:?}", parent))?;
        }
        tokio::fs::write(&self.path, rendered)
            .await
            .with_context(|| format!("error writing {:?}", self.path))?;
        tracing::info!(nosync = no_sync, path = ?self.path, "updated member tags");
        Ok(())
    }
}

/// Render the tags document for the given synchronous standby exclusion.
pub fn render_tags(no_sync: bool) -> Result<String> {
    let doc = TagsDocument { tags: Tags { nosync: no_sync } };
    serde_yaml::to_string(&doc).context("error serializing member tags")
}
