use std::collections::HashSet;
use std::io::IsTerminal;
use std::sync::Arc;

use colored::Colorize;
use serde_json::Value;
use tracing::{debug, info};

use pvebox_api::client::ProxmoxClient;
use pvebox_core::config::{SdnRequest, VmConfig};
use pvebox_core::error::{Error, Result};
use pvebox_core::naming;

use crate::builtin::BuiltinTemplates;
use crate::sdn::{SdnManager, VnetHandle};
use crate::session::ProvisionSession;
use crate::vm::{VmManager, bridge_of, vm_has_tag, vm_is_template};

/// Result of a provisioning run: the created VMs (with their configs),
/// the session zone (if one was created), and the vnets NICs were bound
/// against.
#[derive(Debug)]
pub struct Provisioned {
    pub vms: Vec<(u32, VmConfig)>,
    pub zone_id: Option<String>,
    pub vnets: Vec<VnetHandle>,
}

/// Composes the allocator, lifecycle controller, and template registry
/// into whole-session operations: provision N VMs + 1 network, tear the
/// lot down again, and recover orphans by tag.
pub struct Provisioner {
    sdn: SdnManager,
    vm: VmManager,
    builtins: BuiltinTemplates,
    session: Arc<ProvisionSession>,
}

impl Provisioner {
    pub fn new(client: Arc<ProxmoxClient>, node: &str, session: Arc<ProvisionSession>) -> Self {
        Self {
            sdn: SdnManager::new(client.clone()),
            vm: VmManager::new(client.clone(), node),
            builtins: BuiltinTemplates::new(client, node),
            session,
        }
    }

    pub fn vm_manager(&self) -> &VmManager {
        &self.vm
    }

    pub fn builtins(&self) -> &BuiltinTemplates {
        &self.builtins
    }

    /// Provision a network plus a set of VMs, serialized against other
    /// flows of this session.
    pub async fn provision(
        &self,
        stem: &str,
        sdn_request: &SdnRequest,
        vm_configs: &[VmConfig],
    ) -> Result<Provisioned> {
        let _permit = self.session.serialize().await?;

        let ids_prefix = self.free_ids_prefix(stem).await?;
        info!(%ids_prefix, "provisioning session resources");

        let (zone_id, vnets) = self.sdn.allocate_zone(&ids_prefix, sdn_request).await?;
        if let Some(zone) = &zone_id {
            self.session.register_zone(zone);
        }

        let builtins = self.builtins.known_builtins().await?;

        let mut vms = Vec::new();
        for config in vm_configs {
            let vm_id = self
                .vm
                .create_and_start(&vnets, config, &builtins, &self.session)
                .await?;
            vms.push((vm_id, config.clone()));
        }

        // Each VM already waited once on start; a second pass catches
        // state lost to late cloud-init reboots before handing over.
        for (vm_id, config) in &vms {
            self.vm.await_vm(*vm_id, config.is_sandbox, "running").await?;
        }

        Ok(Provisioned {
            vms,
            zone_id,
            vnets,
        })
    }

    /// An ids prefix whose zone id is not taken yet. The check-then-use
    /// window is racy across sessions; acceptable and documented.
    pub async fn free_ids_prefix(&self, stem: &str) -> Result<String> {
        let zones = self.sdn.list_zones().await?;
        let taken: HashSet<String> = zones
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|zone| zone.get("zone").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        for _ in 0..10_000 {
            let candidate = naming::random_ids_prefix(stem);
            if !taken.contains(&naming::zone_id(&candidate)) {
                return Ok(candidate);
            }
        }
        Err(Error::NoFreeAddressSpace)
    }

    /// Tear down an explicit set of resources: VMs first, zone last.
    pub async fn teardown(&self, zone_id: Option<&str>, vm_ids: &[u32]) -> Result<()> {
        let _permit = self.session.serialize().await?;
        for vm_id in vm_ids {
            self.vm.destroy(*vm_id).await?;
        }
        if let Some(zone) = zone_id {
            self.sdn.teardown_zone(zone).await?;
        }
        Ok(())
    }

    /// Destroy everything this session registered. Runs at most once per
    /// session.
    pub async fn cleanup_session(&self) -> Result<()> {
        if self.session.cleanup_done() {
            return Ok(());
        }
        let _permit = self.session.serialize().await?;
        for vm_id in self.session.vm_ids() {
            self.vm.destroy(vm_id).await?;
        }
        let zones = self.session.zone_ids();
        if !zones.is_empty() {
            self.sdn.teardown_zones(&zones).await?;
        }
        self.session.mark_cleanup_done();
        Ok(())
    }

    /// Crash-orphan recovery with no id list: find every non-template VM
    /// tagged by this system, the zones behind the bridges they use, and
    /// any zone matching the session naming pattern; confirm with the
    /// operator when interactive; destroy VMs first, zones last.
    ///
    /// With nothing to delete this is a strict no-op: no destructive
    /// calls are made.
    pub async fn cleanup_by_tag(&self, assume_yes: bool) -> Result<()> {
        let mut noticed_vms: Vec<(u32, String)> = Vec::new();
        let mut noticed_bridges: HashSet<String> = HashSet::new();

        for vm in self.vm.list_vms().await?.as_array().into_iter().flatten() {
            if !vm_has_tag(vm, naming::SESSION_TAG) || vm_is_template(vm) {
                continue;
            }
            let Some(vm_id) = vm
                .get("vmid")
                .and_then(Value::as_u64)
                .and_then(|id| u32::try_from(id).ok())
            else {
                continue;
            };
            let config = self.vm.read_config(vm_id).await?;
            for (key, value) in config.as_object().into_iter().flatten() {
                if key.starts_with("net")
                    && let Some(bridge) = value.as_str().and_then(bridge_of)
                {
                    noticed_bridges.insert(bridge);
                }
            }
            let name = vm
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("(unnamed)")
                .to_string();
            noticed_vms.push((vm_id, name));
        }

        let mut zones_to_delete = self.zones_for_bridges(&noticed_bridges).await?;
        // A failed setup can leave a session zone with no VMs in it;
        // sweep anything matching the session pattern too.
        for zone in self.sdn.list_zones().await?.as_array().into_iter().flatten() {
            if let Some(zone_id) = zone.get("zone").and_then(Value::as_str)
                && naming::is_session_zone(zone_id)
            {
                zones_to_delete.insert(zone_id.to_string());
            }
        }

        if noticed_vms.is_empty() && zones_to_delete.is_empty() {
            info!("no resources to delete");
            return Ok(());
        }

        println!("{}", "The following resources will be destroyed:".bold());
        for (vm_id, name) in &noticed_vms {
            println!("  vm {vm_id}  {name}");
        }
        for zone in &zones_to_delete {
            println!("  zone {zone}");
        }

        if !assume_yes && !confirm_destruction()? {
            println!("Cancelled.");
            return Ok(());
        }

        for (vm_id, _) in &noticed_vms {
            self.vm.destroy(*vm_id).await?;
        }
        if !zones_to_delete.is_empty() {
            let zones: Vec<String> = zones_to_delete.into_iter().collect();
            self.sdn.teardown_zones(&zones).await?;
        }
        Ok(())
    }

    /// Zones owning any of the given bridges.
    async fn zones_for_bridges(&self, bridges: &HashSet<String>) -> Result<HashSet<String>> {
        let vnets = self.sdn.list_vnets().await?;
        Ok(vnets
            .as_array()
            .into_iter()
            .flatten()
            .filter(|vnet| {
                vnet.get("vnet")
                    .and_then(Value::as_str)
                    .map(|id| bridges.contains(id))
                    .unwrap_or(false)
            })
            .filter_map(|vnet| vnet.get("zone").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

/// Ask the operator before a bulk destroy, but only when someone is
/// actually there: a non-TTY stdin or a CI environment auto-confirms.
fn confirm_destruction() -> Result<bool> {
    let interactive = std::io::stdin().is_terminal() && std::env::var_os("CI").is_none();
    debug!(interactive, "cleanup confirmation");
    if !interactive {
        return Ok(true);
    }
    inquire::Confirm::new("Destroy ALL the resources listed above?")
        .with_default(false)
        .prompt()
        .map_err(|err| Error::Configuration(format!("confirmation failed: {err}")))
}
