use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use pvebox_core::error::{Error, Result};

use crate::client::{Method, ProxmoxClient};
use crate::tasks::TaskMonitor;

/// Image-storage helpers for one node. VM disks themselves stay in the
/// hypervisor's block storage; this only handles uploaded content
/// (archives, ISOs).
pub struct StorageOps {
    client: Arc<ProxmoxClient>,
    tasks: TaskMonitor,
    node: String,
    storage: String,
}

impl StorageOps {
    pub fn new(client: Arc<ProxmoxClient>, node: &str, storage: &str) -> Self {
        Self {
            tasks: TaskMonitor::new(client.clone()),
            client,
            node: node.to_string(),
            storage: storage.to_string(),
        }
    }

    pub fn storage(&self) -> &str {
        &self.storage
    }

    pub async fn list_content(&self) -> Result<Value> {
        self.client
            .request(
                Method::GET,
                &format!("/nodes/{}/storage/{}/content", self.node, self.storage),
                None,
            )
            .await
    }

    /// True when some volume id in this storage ends with `name_end`.
    pub async fn content_exists(&self, name_end: &str) -> Result<bool> {
        let content = self.list_content().await?;
        Ok(content.as_array().into_iter().flatten().any(|item| {
            item.get("volid")
                .and_then(Value::as_str)
                .map(|volid| volid.ends_with(name_end))
                .unwrap_or(false)
        }))
    }

    /// Upload a local file into storage.
    ///
    /// With `size_check`, the upload is skipped when a remote file of the
    /// same name and byte size already exists — re-provisioning from the
    /// same archive is a cheap no-op.
    pub async fn upload(
        &self,
        file: &Path,
        content_type: &str,
        filename: Option<&str>,
        size_check: Option<u64>,
    ) -> Result<()> {
        let remote_name = filename
            .map(str::to_string)
            .or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()))
            .ok_or_else(|| Error::Configuration(format!("no filename for {}", file.display())))?;

        if let Some(expected_size) = size_check {
            let listing = self
                .client
                .request(
                    Method::GET,
                    &format!(
                        "/nodes/{}/storage/{}/content?content={}",
                        self.node, self.storage, content_type
                    ),
                    None,
                )
                .await?;
            for item in listing.as_array().into_iter().flatten() {
                let volid = item.get("volid").and_then(Value::as_str).unwrap_or("");
                if !volid.ends_with(&remote_name) {
                    continue;
                }
                let size_match =
                    item.get("size").and_then(Value::as_u64) == Some(expected_size);
                debug!(
                    volid,
                    size_match, "file already present in storage"
                );
                if size_match {
                    return Ok(());
                }
            }
        }

        self.tasks
            .run_and_await(
                &format!("upload {remote_name}"),
                self.client.upload_multipart(
                    &self.node,
                    &self.storage,
                    file,
                    content_type,
                    Some(&remote_name),
                ),
            )
            .await?;
        Ok(())
    }
}
