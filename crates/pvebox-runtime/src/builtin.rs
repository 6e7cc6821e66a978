use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};

use pvebox_api::client::{Method, ProxmoxClient};
use pvebox_api::storage::StorageOps;
use pvebox_api::tasks::TaskMonitor;
use pvebox_core::cidr::Cidr;
use pvebox_core::config::{DhcpRange, SdnConfig, SdnRequest, SubnetConfig, VnetConfig};
use pvebox_core::error::{Error, Result};
use pvebox_core::naming;
use pvebox_core::retry::Backoff;

use crate::agent::GuestAgent;
use crate::sdn::SdnManager;
use crate::vm::{VmManager, vm_has_tag, vm_is_template};

/// Built-in template names this provider knows how to mint.
pub const BUILTIN_NAMES: &[&str] = &["ubuntu24.04"];

const UBUNTU_OVA_FILENAME: &str = "ubuntu24.04.ova";
const UBUNTU_OVA_URL: &str =
    "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.ova";
const UBUNTU_OVA_DISK: &str = "ubuntu-noble-24.04-cloudimg.vmdk";

/// Large-image operations (server-side download, cloud-init first boot,
/// template conversion) get a generous deadline.
const IMPORT_DEADLINE: Duration = Duration::from_secs(1200);

/// Registry of provider-managed template VMs.
///
/// There is no persisted index: the mapping from symbolic name to
/// template VM id is recomputed by scanning tags on every call, so
/// external mutation (an operator deleting a template) is tolerated
/// instead of cached around.
pub struct BuiltinTemplates {
    client: Arc<ProxmoxClient>,
    tasks: TaskMonitor,
    vm: VmManager,
    sdn: SdnManager,
    agent: GuestAgent,
    storage: StorageOps,
    node: String,
}

impl BuiltinTemplates {
    pub fn new(client: Arc<ProxmoxClient>, node: &str) -> Self {
        Self {
            tasks: TaskMonitor::new(client.clone()),
            vm: VmManager::new(client.clone(), node),
            sdn: SdnManager::new(client.clone()),
            agent: GuestAgent::new(client.clone(), node),
            storage: StorageOps::new(client.clone(), node, "local"),
            client,
            node: node.to_string(),
        }
    }

    /// Symbolic name -> template VM id for every built-in present on the
    /// cluster right now.
    pub async fn known_builtins(&self) -> Result<HashMap<String, u32>> {
        let vms = self.vm.list_vms().await?;
        let mut found = HashMap::new();
        for name in BUILTIN_NAMES {
            let tag = naming::builtin_tag(name);
            let id = vms
                .as_array()
                .into_iter()
                .flatten()
                .find(|vm| {
                    vm_is_template(vm)
                        && vm_has_tag(vm, naming::SESSION_TAG)
                        && vm_has_tag(vm, &tag)
                })
                .and_then(|vm| vm.get("vmid").and_then(Value::as_u64))
                .and_then(|id| u32::try_from(id).ok());
            if let Some(id) = id {
                found.insert(name.to_string(), id);
            }
        }
        Ok(found)
    }

    /// Make sure the named built-in template exists, minting it from the
    /// published cloud image if needed. Idempotent and safe to call
    /// before every provisioning run.
    pub async fn ensure_exists(&self, name: &str) -> Result<()> {
        if self.known_builtins().await?.contains_key(name) {
            return Ok(());
        }
        match name {
            "ubuntu24.04" => self.mint_ubuntu_template().await,
            other => Err(Error::Configuration(format!("unknown built-in {other:?}"))),
        }
    }

    async fn mint_ubuntu_template(&self) -> Result<()> {
        self.fetch_ova().await?;
        self.ensure_static_zone().await?;

        let vm_id = self.vm.next_vm_id().await?;
        let vnet_id = naming::vnet_id(naming::STATIC_IDS_PREFIX, 0);

        info!(vm_id, "creating built-in template VM");
        let create_json = json!({
            "vmid": vm_id,
            "name": "inspect-ubuntu24.04",
            "node": self.node,
            "cpu": "host",
            "memory": 8192,
            "cores": 2,
            "ostype": "l26",
            "scsi0": format!(
                "local-lvm:0,import-from=local:import/{UBUNTU_OVA_FILENAME}/{UBUNTU_OVA_DISK},format=qcow2,cache=writeback"
            ),
            "scsihw": "virtio-scsi-single",
            "net0": format!("virtio,bridge={vnet_id}"),
            "serial0": "socket",
            "start": false,
            "agent": "enabled=1",
            // Native cloud-init drive; detached again before templating.
            "ide2": "local-lvm:cloudinit",
            "ipconfig0": "ip=dhcp",
        });
        self.tasks
            .run_and_await(
                &format!("create built-in vm {vm_id}"),
                self.client.request(
                    Method::POST,
                    &format!("/nodes/{}/qemu", self.node),
                    Some(&create_json),
                ),
            )
            .await?;

        self.tasks
            .run_and_await(
                &format!("tag built-in vm {vm_id}"),
                self.client.request(
                    Method::POST,
                    &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
                    Some(&json!({
                        "tags": format!("{},{}", naming::SESSION_TAG, naming::builtin_tag("ubuntu24.04")),
                    })),
                ),
            )
            .await?;

        self.vm.start_and_await(vm_id, true).await?;
        self.await_cloud_init(vm_id).await?;
        self.snapshot_once(vm_id, "post-cloudinit").await?;

        info!(vm_id, "shutting down and templating built-in VM");
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/status/shutdown", self.node),
                None,
            )
            .await?;
        self.vm.await_vm(vm_id, true, "stopped").await?;

        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/template", self.node),
                None,
            )
            .await?;
        Backoff::with_deadline(IMPORT_DEADLINE)
            .poll_until(&format!("vm {vm_id} template conversion"), || async move {
                let config = self
                    .client
                    .request(
                        Method::GET,
                        &format!("/nodes/{}/qemu/{vm_id}/config?current=1", self.node),
                        None,
                    )
                    .await?;
                Ok(
                    if config.get("template").and_then(Value::as_i64) == Some(1) {
                        Some(())
                    } else {
                        None
                    },
                )
            })
            .await?;

        // Conversion can hold a lock on the config briefly.
        Backoff::with_deadline(Duration::from_secs(30))
            .retry("detach cloud-init drive", || async move {
                self.client
                    .request(
                        Method::POST,
                        &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
                        Some(&json!({ "ide2": "none,media=cdrom" })),
                    )
                    .await?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Server-side fetch of the published OVA into storage, skipped when
    /// it is already there.
    async fn fetch_ova(&self) -> Result<()> {
        if self.storage.content_exists(UBUNTU_OVA_FILENAME).await? {
            debug!("built-in OVA already present");
            return Ok(());
        }
        info!(url = UBUNTU_OVA_URL, "downloading built-in OVA");
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/storage/local/download-url", self.node),
                Some(&json!({
                    "content": "import",
                    "filename": UBUNTU_OVA_FILENAME,
                    "url": UBUNTU_OVA_URL,
                })),
            )
            .await?;
        Backoff::with_deadline(IMPORT_DEADLINE)
            .poll_until("built-in OVA download", || async move {
                Ok(if self.storage.content_exists(UBUNTU_OVA_FILENAME).await? {
                    Some(())
                } else {
                    None
                })
            })
            .await?;
        Ok(())
    }

    /// The static zone built-in templates boot in. Created on demand,
    /// never torn down.
    async fn ensure_static_zone(&self) -> Result<()> {
        let zone_id = naming::zone_id(naming::STATIC_IDS_PREFIX);
        let exists = self
            .sdn
            .list_zones()
            .await?
            .as_array()
            .into_iter()
            .flatten()
            .any(|zone| zone.get("zone").and_then(Value::as_str) == Some(zone_id.as_str()));
        if exists {
            return Ok(());
        }
        let config = SdnConfig {
            vnets: vec![VnetConfig {
                alias: None,
                subnets: vec![SubnetConfig {
                    cidr: Cidr::new("192.168.99.0/24")?,
                    gateway: "192.168.99.1"
                        .parse()
                        .map_err(|_| Error::Configuration("bad static gateway".into()))?,
                    snat: true,
                    dhcp_ranges: vec![DhcpRange {
                        start: "192.168.99.50"
                            .parse()
                            .map_err(|_| Error::Configuration("bad static range".into()))?,
                        end: "192.168.99.100"
                            .parse()
                            .map_err(|_| Error::Configuration("bad static range".into()))?,
                    }],
                }],
            }],
            use_pve_ipam_dnsmasq: true,
        };
        self.sdn
            .allocate_zone(naming::STATIC_IDS_PREFIX, &SdnRequest::Custom(config))
            .await?;
        Ok(())
    }

    /// Drive `cloud-init status --wait` through the agent until it
    /// reports done. A non-done terminal answer means first boot failed.
    async fn await_cloud_init(&self, vm_id: u32) -> Result<()> {
        let pid = self
            .agent
            .spawn(
                vm_id,
                &[
                    "cloud-init".to_string(),
                    "status".to_string(),
                    "--wait".to_string(),
                ],
            )
            .await?;

        Backoff::with_deadline(IMPORT_DEADLINE)
            .poll_until(&format!("cloud-init in vm {vm_id}"), || async move {
                let status = self.agent.exec_status(vm_id, pid).await?;
                if status.get("exited").and_then(Value::as_i64) != Some(1) {
                    return Ok(None);
                }
                let out = status
                    .get("out-data")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if out == "status: done" {
                    Ok(Some(()))
                } else {
                    Err(Error::Agent(format!("cloud-init failed: {out}")))
                }
            })
            .await
    }

    /// Create the named snapshot unless it exists, wait for the snapshot
    /// job, then verify it is visible.
    async fn snapshot_once(&self, vm_id: u32, name: &str) -> Result<()> {
        if self.agent.snapshot_exists(vm_id, name).await? {
            debug!(vm_id, name, "snapshot already exists");
            return Ok(());
        }
        self.tasks
            .run_and_await(
                &format!("snapshot {name} of vm {vm_id}"),
                self.agent.create_snapshot(vm_id, name),
            )
            .await?;
        Backoff::with_deadline(Duration::from_secs(120))
            .poll_until(&format!("snapshot {name} visible"), || async move {
                Ok(if self.agent.snapshot_exists(vm_id, name).await? {
                    Some(())
                } else {
                    None
                })
            })
            .await
    }
}
