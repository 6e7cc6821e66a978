use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::{debug, info};

use pvebox_api::client::Method;
use pvebox_core::config::{OsType, VmConfig, VmSource};
use pvebox_core::error::{Error, Result};
use pvebox_core::naming;

use super::{VmManager, vm_has_tag, vm_is_template};
use crate::sdn::VnetHandle;
use crate::session::ProvisionSession;

/// Snapshot name the clone fast path looks for on template sources.
const CLONE_SNAPSHOT: &str = "post-cloudinit";

impl VmManager {
    /// Resolve the source descriptor, create (or reuse) whatever
    /// intermediate template it needs, clone, configure, start, and
    /// return the new VM id. Every created VM is registered with the
    /// session before any wait that could fail, so cleanup can always
    /// find it.
    pub async fn create_and_start(
        &self,
        session_vnets: &[VnetHandle],
        config: &VmConfig,
        builtins: &HashMap<String, u32>,
        session: &ProvisionSession,
    ) -> Result<u32> {
        if config.disk_controller.is_some() && !matches!(config.source, VmSource::Ova(_)) {
            return Err(Error::Configuration(
                "disk_controller is only supported for OVA sources".into(),
            ));
        }
        if config.os_type != OsType::L26 && !matches!(config.source, VmSource::Ova(_)) {
            return Err(Error::Configuration(
                "os_type is only supported for OVA sources".into(),
            ));
        }

        match &config.source {
            VmSource::BuiltIn(name) => {
                let template_id = builtins.get(name.as_str()).copied().ok_or_else(|| {
                    Error::NotFound(format!(
                        "no template for built-in {name:?}; ensure it exists first"
                    ))
                })?;
                self.clone_and_start(config, template_id, session_vnets, true, session)
                    .await
            }
            VmSource::Ova(path) => {
                let template_id = self
                    .resolve_ova_template(path, config, session_vnets)
                    .await?;
                let new_vm_id = self
                    .clone_and_start(
                        config,
                        template_id,
                        session_vnets,
                        config.is_sandbox,
                        session,
                    )
                    .await?;
                Ok(new_vm_id)
            }
            VmSource::ExistingTemplateTag(tag) => {
                let template_id = self.find_template_by_tag(tag).await?;
                self.clone_and_start(config, template_id, session_vnets, true, session)
                    .await
            }
        }
    }

    /// Exactly one template must carry the tag: zero is a lookup failure
    /// the caller can fix by importing, more than one means the tag no
    /// longer identifies anything.
    pub(crate) async fn find_template_by_tag(&self, tag: &str) -> Result<u32> {
        let vms = self.list_vms().await?;
        let matches: Vec<u32> = vms
            .as_array()
            .into_iter()
            .flatten()
            .filter(|vm| {
                vm_is_template(vm)
                    && vm_has_tag(vm, naming::SESSION_TAG)
                    && vm_has_tag(vm, tag)
            })
            .filter_map(|vm| vm.get("vmid").and_then(Value::as_u64))
            .filter_map(|id| u32::try_from(id).ok())
            .collect();
        match matches.as_slice() {
            [] => Err(Error::NotFound(format!("no template with tag {tag:?}"))),
            [only] => Ok(*only),
            many => Err(Error::Ambiguous(format!(
                "multiple templates with tag {tag:?}: {many:?}"
            ))),
        }
    }

    /// Import a disk-image archive as a template, or reuse the template a
    /// previous import minted for the identical archive.
    async fn resolve_ova_template(
        &self,
        path: &Path,
        config: &VmConfig,
        session_vnets: &[VnetHandle],
    ) -> Result<u32> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Configuration(format!("archive path has no filename: {}", path.display()))
            })?;
        let size = tokio::fs::metadata(path).await?.len();
        let content_tag = naming::ova_tag(&file_name, size);

        let vms = self.list_vms().await?;
        let existing = vms
            .as_array()
            .into_iter()
            .flatten()
            .find(|vm| {
                vm_is_template(vm)
                    && vm_has_tag(vm, naming::SESSION_TAG)
                    && vm_has_tag(vm, &content_tag)
            })
            .and_then(|vm| vm.get("vmid").and_then(Value::as_u64))
            .and_then(|id| u32::try_from(id).ok());
        if let Some(template_id) = existing {
            debug!(template_id, %content_tag, "reusing imported template");
            return Ok(template_id);
        }

        self.storage
            .upload(path, "import", None, Some(size))
            .await?;

        let disk_prefix = config
            .disk_controller
            .map(|controller| controller.as_str())
            .unwrap_or("scsi");
        let disk_images = list_disk_images(path.to_path_buf()).await?;
        if disk_images.is_empty() {
            return Err(Error::Configuration(format!(
                "no disk images found in {}",
                path.display()
            )));
        }

        let template_id = self.next_vm_id().await?;
        let mut create_json = json!({
            "vmid": template_id,
            "node": self.node,
            "cpu": "host",
            "ostype": config.os_type.as_str(),
            "scsihw": "virtio-scsi-single",
            "start": false,
        });
        apply_resource_overrides(config, &mut create_json);
        // Disk references follow the import-from form the GUI generates;
        // reverse-engineered and possibly brittle across releases.
        for (index, disk) in disk_images.iter().enumerate() {
            create_json[format!("{disk_prefix}{index}")] = json!(format!(
                "local-lvm:0,import-from={}:import/{file_name}/{disk},format=qcow2,cache=writeback",
                self.storage.storage()
            ));
        }

        info!(template_id, %file_name, "creating VM from archive");
        self.tasks
            .run_and_await(
                &format!("import archive into vm {template_id}"),
                self.client.request(
                    Method::POST,
                    &format!("/nodes/{}/qemu", self.node),
                    Some(&create_json),
                ),
            )
            .await?;

        self.configure_network_and_tags(
            template_id,
            config,
            session_vnets,
            &[content_tag.clone()],
        )
        .await?;

        self.tasks
            .run_and_await(
                &format!("convert vm {template_id} to template"),
                self.client.request(
                    Method::POST,
                    &format!("/nodes/{}/qemu/{template_id}/template", self.node),
                    None,
                ),
            )
            .await?;

        // Templates stay network-config-free so every clone gets fresh
        // addressing.
        self.remove_existing_nics(template_id).await?;

        Ok(template_id)
    }

    /// Linked-clone `source_vm_id`, configure, start, and await.
    ///
    /// `preserve_tags` marks template sources: their tags carry over and
    /// the `post-cloudinit` snapshot fast path applies.
    pub(crate) async fn clone_and_start(
        &self,
        config: &VmConfig,
        source_vm_id: u32,
        session_vnets: &[VnetHandle],
        preserve_tags: bool,
        session: &ProvisionSession,
    ) -> Result<u32> {
        let new_vm_id = self.next_vm_id().await?;

        let snapshot = if preserve_tags {
            // Best-effort: any lookup failure falls back to a full clone.
            // This also swallows transient errors, which can mask a real
            // failure; see the design notes.
            match self.agent.snapshot_exists(source_vm_id, CLONE_SNAPSHOT).await {
                Ok(true) => {
                    info!(source_vm_id, "cloning from {CLONE_SNAPSHOT} snapshot");
                    Some(CLONE_SNAPSHOT)
                }
                Ok(false) => None,
                Err(err) => {
                    debug!(source_vm_id, error = %err, "snapshot lookup failed, cloning from current state");
                    None
                }
            }
        } else {
            None
        };

        let mut clone_json = json!({ "newid": new_vm_id, "full": 0 });
        if let Some(name) = &config.name {
            clone_json["name"] = json!(name);
        }
        if let Some(snapname) = snapshot {
            clone_json["snapname"] = json!(snapname);
        }

        self.tasks
            .run_and_await(&format!("clone vm {source_vm_id} -> {new_vm_id}"), async {
                self.client
                    .request(
                        Method::POST,
                        &format!("/nodes/{}/qemu/{source_vm_id}/clone", self.node),
                        Some(&clone_json),
                    )
                    .await?;
                // Registered as soon as the request lands so a failed
                // wait still leaves the clone findable by cleanup.
                session.register_vm(new_vm_id);
                Ok(())
            })
            .await?;

        let mut extra_tags = Vec::new();
        if preserve_tags {
            let source_config = self.read_config(source_vm_id).await?;
            if let Some(tags) = source_config.get("tags").and_then(Value::as_str) {
                extra_tags.extend(tags.split(';').map(str::to_string));
            }
        }

        self.configure_network_and_tags(new_vm_id, config, session_vnets, &extra_tags)
            .await?;

        let mut overrides = json!({});
        apply_resource_overrides(config, &mut overrides);
        self.tasks
            .run_and_await(
                &format!("apply resources to vm {new_vm_id}"),
                self.client.request(
                    Method::POST,
                    &format!("/nodes/{}/qemu/{new_vm_id}/config", self.node),
                    Some(&overrides),
                ),
            )
            .await?;

        self.start_and_await(new_vm_id, config.is_sandbox).await?;
        Ok(new_vm_id)
    }
}

/// Resource fields shared by create-from-archive and post-clone
/// configuration.
pub(crate) fn apply_resource_overrides(config: &VmConfig, target: &mut Value) {
    target["agent"] = json!(format!(
        "enabled={}",
        if config.is_sandbox { 1 } else { 0 }
    ));
    target["memory"] = json!(config.ram_mb);
    target["cores"] = json!(config.vcpus);
    if let Some(name) = &config.name {
        target["name"] = json!(name);
    }
    if config.uefi_boot {
        // The archive metadata may already say UEFI, but the hypervisor
        // does not honor it on import; set it explicitly.
        target["efidisk0"] = json!("local-lvm:0,efitype=4m,pre-enrolled-keys=0");
        target["bios"] = json!("ovmf");
    }
}

/// Disk-image members of a tar archive, in archive order. Runs on a
/// blocking thread: listing seeks through the whole file.
async fn list_disk_images(path: PathBuf) -> Result<Vec<String>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let file = std::fs::File::open(&path)?;
        let mut archive = tar::Archive::new(file);
        let mut disks = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            if name.ends_with(".vmdk") {
                disks.push(name);
            }
        }
        Ok(disks)
    })
    .await
    .map_err(|err| Error::Configuration(format!("archive listing failed: {err}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvebox_core::config::VmConfig;
    use std::io::Write;

    #[test]
    fn test_resource_overrides_sandbox() {
        let mut config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        config.ram_mb = 768;
        config.vcpus = 3;
        config.name = Some("worker-1".into());
        let mut target = json!({});
        apply_resource_overrides(&config, &mut target);
        assert_eq!(target["agent"], "enabled=1");
        assert_eq!(target["memory"], 768);
        assert_eq!(target["cores"], 3);
        assert_eq!(target["name"], "worker-1");
        assert!(target.get("bios").is_none());
    }

    #[test]
    fn test_resource_overrides_non_sandbox_uefi() {
        let mut config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        config.is_sandbox = false;
        config.uefi_boot = true;
        let mut target = json!({});
        apply_resource_overrides(&config, &mut target);
        assert_eq!(target["agent"], "enabled=0");
        assert_eq!(target["bios"], "ovmf");
        assert_eq!(target["efidisk0"], "local-lvm:0,efitype=4m,pre-enrolled-keys=0");
    }

    #[tokio::test]
    async fn test_list_disk_images_filters_vmdk() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("image.ova");
        {
            let file = std::fs::File::create(&archive_path).unwrap();
            let mut builder = tar::Builder::new(file);
            for (name, content) in [
                ("image.ovf", "<ovf/>"),
                ("disk-1.vmdk", "AAAA"),
                ("disk-2.vmdk", "BBBB"),
                ("manifest.mf", "sums"),
            ] {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, name, content.as_bytes())
                    .unwrap();
            }
            let mut file = builder.into_inner().unwrap();
            file.flush().unwrap();
        }

        let disks = list_disk_images(archive_path).await.unwrap();
        assert_eq!(disks, vec!["disk-1.vmdk".to_string(), "disk-2.vmdk".to_string()]);
    }
}
