use std::sync::Arc;

use rand::seq::SliceRandom;
use serde_json::{Value, json};
use tracing::{debug, info};

use pvebox_api::client::{Method, ProxmoxClient};
use pvebox_api::tasks::TaskMonitor;
use pvebox_core::cidr::{Cidr, find_overlaps, find_self_overlaps};
use pvebox_core::config::{DhcpRange, SdnConfig, SdnRequest, SubnetConfig, VnetConfig};
use pvebox_core::error::{Error, Result};
use pvebox_core::naming;

/// A vnet the session can bind NICs to: the hypervisor-side id plus the
/// caller-facing alias (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnetHandle {
    pub id: String,
    pub alias: Option<String>,
}

/// Allocates and tears down isolated virtual-network zones.
///
/// Zone-id collision is possible under concurrency: two sessions can pick
/// the same random suffix between the free-check and the create. The
/// allocator does not lock; callers needing strict isolation serialize
/// provisioning (see `ProvisionSession`).
pub struct SdnManager {
    client: Arc<ProxmoxClient>,
    tasks: TaskMonitor,
}

impl SdnManager {
    pub fn new(client: Arc<ProxmoxClient>) -> Self {
        Self {
            tasks: TaskMonitor::new(client.clone()),
            client,
        }
    }

    /// Reserve the network space a session asked for.
    ///
    /// `UseExisting` creates nothing and returns the pre-existing vnets
    /// (id + alias) for reuse; `Auto` synthesizes a single vnet on a free
    /// /24; `Custom` validates and creates the given layout. On creation
    /// the zone id is derived from `ids_prefix` and returned.
    pub async fn allocate_zone(
        &self,
        ids_prefix: &str,
        request: &SdnRequest,
    ) -> Result<(Option<String>, Vec<VnetHandle>)> {
        let config = match request {
            SdnRequest::UseExisting => {
                let vnets = self.list_vnets().await?;
                let handles = vnets
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|vnet| {
                        let id = vnet.get("vnet").and_then(Value::as_str)?;
                        let alias = vnet.get("alias").and_then(Value::as_str)?;
                        Some(VnetHandle {
                            id: id.to_string(),
                            alias: Some(alias.to_string()),
                        })
                    })
                    .collect();
                return Ok((None, handles));
            }
            SdnRequest::Auto => self.generate_auto_config().await?,
            SdnRequest::Custom(config) => config.clone(),
        };

        self.check_cidrs(&config.vnets).await?;
        if config.vnets.is_empty() {
            return Err(Error::Configuration("no vnets provided".into()));
        }
        if config.vnets.len() > 10 {
            return Err(Error::Configuration(format!(
                "too many vnets; max 10, got {}",
                config.vnets.len()
            )));
        }
        validate_ipam_dhcp(&config)?;

        let (zone_id, handles) = self.create_zone_objects(ids_prefix, &config).await?;
        Ok((Some(zone_id), handles))
    }

    /// Synthesize a single-vnet config on a random free /24. The range is
    /// deliberately randomized so callers don't grow dependencies on a
    /// fixed address plan.
    async fn generate_auto_config(&self) -> Result<SdnConfig> {
        let existing = self.read_all_simple_zone_cidrs().await?;
        let vnet = pick_auto_vnet(&existing, None)?;
        Ok(SdnConfig {
            vnets: vec![vnet],
            use_pve_ipam_dnsmasq: true,
        })
    }

    /// Reject any CIDR overlap among the proposed subnets or against
    /// subnets already present in simple zones.
    async fn check_cidrs(&self, vnets: &[VnetConfig]) -> Result<()> {
        let existing = self.read_all_simple_zone_cidrs().await?;
        let proposed: Vec<Cidr> = vnets
            .iter()
            .flat_map(|vnet| vnet.subnets.iter().map(|subnet| subnet.cidr.clone()))
            .collect();

        let mut overlaps = find_overlaps(&existing, &proposed);
        overlaps.extend(find_self_overlaps(&proposed));
        if !overlaps.is_empty() {
            let pairs: Vec<String> = overlaps
                .iter()
                .map(|(a, b)| format!("({a}, {b})"))
                .collect();
            return Err(Error::Configuration(format!(
                "overlapping IP ranges: {}",
                pairs.join(", ")
            )));
        }
        Ok(())
    }

    async fn create_zone_objects(
        &self,
        ids_prefix: &str,
        config: &SdnConfig,
    ) -> Result<(String, Vec<VnetHandle>)> {
        let zone_id = naming::zone_id(ids_prefix);
        // Anything else would escape cleanup-by-tag later.
        if !naming::is_valid_zone_id(&zone_id) {
            return Err(Error::Configuration(format!("invalid zone id {zone_id:?}")));
        }

        info!(%zone_id, vnets = config.vnets.len(), "creating SDN zone");

        let mut zone_json = json!({ "type": "simple", "zone": zone_id });
        if config.use_pve_ipam_dnsmasq {
            zone_json["ipam"] = json!("pve");
            zone_json["dhcp"] = json!("dnsmasq");
        }
        self.tasks
            .run_and_await(
                &format!("create zone {zone_id}"),
                self.client
                    .request(Method::POST, "/cluster/sdn/zones", Some(&zone_json)),
            )
            .await?;

        let mut handles = Vec::new();
        for (index, vnet_config) in config.vnets.iter().enumerate() {
            let vnet_id = naming::vnet_id(ids_prefix, index);
            let mut vnet_json = json!({ "vnet": vnet_id, "zone": zone_id });
            if let Some(alias) = &vnet_config.alias {
                vnet_json["alias"] = json!(alias);
            }
            self.tasks
                .run_and_await(
                    &format!("create vnet {vnet_id}"),
                    self.client
                        .request(Method::POST, "/cluster/sdn/vnets", Some(&vnet_json)),
                )
                .await?;
            handles.push(VnetHandle {
                id: vnet_id.clone(),
                alias: vnet_config.alias.clone(),
            });

            for subnet in &vnet_config.subnets {
                let subnet_json = json!({
                    "subnet": subnet.cidr.as_str(),
                    "type": "subnet",
                    "vnet": vnet_id,
                    "gateway": subnet.gateway.to_string(),
                    "snat": subnet.snat,
                    "dhcp-range": subnet
                        .dhcp_ranges
                        .iter()
                        .map(DhcpRange::to_api_format)
                        .collect::<Vec<_>>(),
                });
                self.tasks
                    .run_and_await(
                        &format!("create subnet {} in {vnet_id}", subnet.cidr),
                        self.client.request(
                            Method::POST,
                            &format!("/cluster/sdn/vnets/{vnet_id}/subnets"),
                            Some(&subnet_json),
                        ),
                    )
                    .await?;
            }
        }

        self.apply_sdn().await?;
        Ok((zone_id, handles))
    }

    /// Commit pending SDN changes cluster-wide and wait for the reload
    /// jobs to drain.
    pub async fn apply_sdn(&self) -> Result<()> {
        self.tasks
            .run_and_await(
                "apply SDN",
                self.client.request(Method::PUT, "/cluster/sdn", None),
            )
            .await?;
        Ok(())
    }

    pub async fn list_zones(&self) -> Result<Value> {
        self.client
            .request(Method::GET, "/cluster/sdn/zones", None)
            .await
    }

    pub async fn list_vnets(&self) -> Result<Value> {
        self.client
            .request(Method::GET, "/cluster/sdn/vnets", None)
            .await
    }

    /// Every subnet CIDR currently attached to a simple zone.
    pub async fn read_all_simple_zone_cidrs(&self) -> Result<Vec<Cidr>> {
        let zones = self.list_zones().await?;
        let simple_zones: Vec<&str> = zones
            .as_array()
            .into_iter()
            .flatten()
            .filter(|zone| zone.get("type").and_then(Value::as_str) == Some("simple"))
            .filter_map(|zone| zone.get("zone").and_then(Value::as_str))
            .collect();

        let vnets = self.list_vnets().await?;
        let mut cidrs = Vec::new();
        for vnet in vnets.as_array().into_iter().flatten() {
            let in_simple_zone = vnet
                .get("zone")
                .and_then(Value::as_str)
                .map(|zone| simple_zones.contains(&zone))
                .unwrap_or(false);
            if !in_simple_zone {
                continue;
            }
            let Some(vnet_id) = vnet.get("vnet").and_then(Value::as_str) else {
                continue;
            };
            let subnets = self
                .client
                .request(
                    Method::GET,
                    &format!("/cluster/sdn/vnets/{vnet_id}/subnets"),
                    None,
                )
                .await?;
            for subnet in subnets.as_array().into_iter().flatten() {
                if let Some(cidr) = subnet.get("cidr").and_then(Value::as_str) {
                    cidrs.push(Cidr::new(cidr)?);
                }
            }
        }
        Ok(cidrs)
    }

    pub async fn teardown_zone(&self, zone_id: &str) -> Result<()> {
        self.teardown_zones(&[zone_id.to_string()]).await
    }

    /// Delete subnets, then vnets, then each zone, then apply. Objects
    /// already removed by a crashed run are skipped, so reruns converge.
    pub async fn teardown_zones(&self, zone_ids: &[String]) -> Result<()> {
        for zone_id in zone_ids {
            info!(%zone_id, "tearing down SDN zone");
            let vnets = self.list_vnets().await?;
            let zone_vnets: Vec<String> = vnets
                .as_array()
                .into_iter()
                .flatten()
                .filter(|vnet| vnet.get("zone").and_then(Value::as_str) == Some(zone_id))
                .filter_map(|vnet| vnet.get("vnet").and_then(Value::as_str))
                .map(str::to_string)
                .collect();

            for vnet_id in zone_vnets {
                let subnets = match self
                    .client
                    .request(
                        Method::GET,
                        &format!("/cluster/sdn/vnets/{vnet_id}/subnets"),
                        None,
                    )
                    .await
                {
                    Ok(subnets) => subnets,
                    Err(err) if err.is_gone() => Value::Null,
                    Err(err) => return Err(err),
                };
                for subnet in subnets.as_array().into_iter().flatten() {
                    if let Some(subnet_id) = subnet.get("id").and_then(Value::as_str) {
                        self.delete_ignoring_gone(&format!(
                            "/cluster/sdn/vnets/{vnet_id}/subnets/{subnet_id}"
                        ))
                        .await?;
                    }
                }
                self.delete_ignoring_gone(&format!("/cluster/sdn/vnets/{vnet_id}"))
                    .await?;
            }
            self.delete_ignoring_gone(&format!("/cluster/sdn/zones/{zone_id}"))
                .await?;
        }

        self.apply_sdn().await
    }

    async fn delete_ignoring_gone(&self, path: &str) -> Result<()> {
        match self.client.request(Method::DELETE, path, None).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_gone() => {
                debug!(path, "already gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Validate the both-or-neither contract between DHCP ranges and
/// platform-managed IPAM.
pub(crate) fn validate_ipam_dhcp(config: &SdnConfig) -> Result<()> {
    let has_range = config
        .vnets
        .iter()
        .flat_map(|vnet| vnet.subnets.iter())
        .any(|subnet| !subnet.dhcp_ranges.is_empty());

    if config.use_pve_ipam_dnsmasq && !has_range {
        return Err(Error::Configuration(
            "DHCP ranges must be provided when use_pve_ipam_dnsmasq=true".into(),
        ));
    }
    if !config.use_pve_ipam_dnsmasq && has_range {
        return Err(Error::Configuration(
            "DHCP ranges cannot be provided when use_pve_ipam_dnsmasq=false".into(),
        ));
    }
    Ok(())
}

/// The standard single-subnet vnet shape used for synthesized networks:
/// 192.168.X.0/24, gateway .1, SNAT on, DHCP leases .50-.100.
pub(crate) fn simple_vnet(third_octet: u8, alias: Option<String>) -> VnetConfig {
    VnetConfig {
        alias,
        subnets: vec![SubnetConfig {
            cidr: Cidr::new(&format!("192.168.{third_octet}.0/24")).expect("static /24"),
            gateway: format!("192.168.{third_octet}.1").parse().expect("static ip"),
            snat: true,
            dhcp_ranges: vec![DhcpRange {
                start: format!("192.168.{third_octet}.50").parse().expect("static ip"),
                end: format!("192.168.{third_octet}.100")
                    .parse()
                    .expect("static ip"),
            }],
        }],
    }
}

/// Pick a /24 in 192.168.2.0-192.168.252.0 that overlaps none of
/// `existing`, trying candidates in shuffled order.
pub(crate) fn pick_auto_vnet(existing: &[Cidr], alias: Option<String>) -> Result<VnetConfig> {
    let mut candidates: Vec<u8> = (2..=252).collect();
    candidates.shuffle(&mut rand::thread_rng());
    for third_octet in candidates {
        let candidate =
            Cidr::new(&format!("192.168.{third_octet}.0/24")).expect("static /24");
        if existing.iter().any(|cidr| cidr.overlaps(&candidate)) {
            continue;
        }
        return Ok(simple_vnet(third_octet, alias));
    }
    Err(Error::NoFreeAddressSpace)
}
