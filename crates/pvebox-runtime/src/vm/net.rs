use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Value, json};
use tracing::{debug, error};

use pvebox_api::client::Method;
use pvebox_core::config::{VmConfig, VmSource};
use pvebox_core::error::{Error, Result};
use pvebox_core::naming;

use super::VmManager;
use crate::sdn::VnetHandle;

/// The `netN` entries a VM should end up with, in slot order. `None`
/// means networking is left exactly as the source configured it.
pub(crate) type InterfacePlan = Option<Vec<(String, String)>>;

/// Decide the interface layout for a VM.
///
/// - `nics: None` with a built-in/OVA source binds slot 0 to the first
///   session vnet (or nothing if the session has none); other sources
///   are left untouched — the template is assumed pre-configured.
/// - `nics: Some([])` deliberately strips every NIC.
/// - Explicit NICs resolve their alias against the session's vnets
///   first, then against pre-existing cluster vnets; an unresolved alias
///   is a configuration error.
pub(crate) fn plan_interfaces(
    config: &VmConfig,
    session_vnets: &[VnetHandle],
    existing_aliases: &HashMap<String, String>,
) -> Result<InterfacePlan> {
    let nic_prefix = config
        .nic_controller
        .map(|controller| controller.as_str())
        .unwrap_or("virtio");

    let Some(nics) = &config.nics else {
        return Ok(match config.source {
            VmSource::BuiltIn(_) | VmSource::Ova(_) => {
                let mut plan = Vec::new();
                if let Some(first) = session_vnets.first() {
                    plan.push(("net0".to_string(), format!("{nic_prefix},bridge={}", first.id)));
                }
                Some(plan)
            }
            VmSource::ExistingTemplateTag(_) => None,
        });
    };

    let session_aliases: HashMap<&str, &str> = session_vnets
        .iter()
        .filter_map(|vnet| vnet.alias.as_deref().map(|alias| (alias, vnet.id.as_str())))
        .collect();

    let mut plan = Vec::new();
    for (index, nic) in nics.iter().enumerate() {
        let bridge = session_aliases
            .get(nic.vnet_alias.as_str())
            .copied()
            .or_else(|| existing_aliases.get(&nic.vnet_alias).map(String::as_str))
            .ok_or_else(|| {
                Error::Configuration(format!("vnet alias {:?} not found", nic.vnet_alias))
            })?;
        let mut entry = format!("{nic_prefix},bridge={bridge}");
        if let Some(mac) = &nic.mac {
            entry.push_str(&format!(",macaddr={mac}"));
        }
        plan.push((format!("net{index}"), entry));
    }
    Ok(Some(plan))
}

/// Extract the bridge target from a `netN` config value like
/// `virtio=BC:24:11:3E:C3:BA,bridge=tcc919v0,firewall=1`.
pub(crate) fn bridge_of(net_value: &str) -> Option<String> {
    net_value
        .split(',')
        .find_map(|segment| segment.strip_prefix("bridge="))
        .map(str::to_string)
}

impl VmManager {
    /// Remove every existing interface definition. Safe to run on a VM
    /// with no NICs, which makes network configuration an idempotent
    /// reset rather than an accumulation.
    pub(crate) async fn remove_existing_nics(&self, vm_id: u32) -> Result<()> {
        let config = self.read_config(vm_id).await?;
        let nic_keys: Vec<&str> = config
            .as_object()
            .into_iter()
            .flat_map(|map| map.keys())
            .filter(|key| key.starts_with("net"))
            .map(String::as_str)
            .collect();
        for key in nic_keys {
            self.client
                .request_form(
                    Method::PUT,
                    &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
                    &format!("delete={key}"),
                )
                .await?;
        }
        Ok(())
    }

    /// Apply the interface plan and the session tags, each wrapped by the
    /// task synchronizer.
    pub(crate) async fn configure_network_and_tags(
        &self,
        vm_id: u32,
        config: &VmConfig,
        session_vnets: &[VnetHandle],
        extra_tags: &[String],
    ) -> Result<()> {
        self.tasks
            .run_and_await(&format!("configure network of vm {vm_id}"), async {
                // Cluster-wide aliases are a best-effort enrichment: a
                // failed lookup only narrows what aliases can resolve.
                let existing_aliases = match self.existing_vnet_aliases().await {
                    Ok(aliases) => aliases,
                    Err(err) => {
                        error!(error = %err, "failed to fetch existing vnets");
                        HashMap::new()
                    }
                };
                debug!(?existing_aliases, ?session_vnets, "resolving interfaces");

                let plan = plan_interfaces(config, session_vnets, &existing_aliases)?;
                if let Some(interfaces) = plan {
                    self.remove_existing_nics(vm_id).await?;
                    if !interfaces.is_empty() {
                        let mut payload = BTreeMap::new();
                        for (slot, value) in interfaces {
                            payload.insert(slot, Value::String(value));
                        }
                        self.client
                            .request(
                                Method::POST,
                                &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
                                Some(&json!(payload)),
                            )
                            .await?;
                    }
                }
                Ok(())
            })
            .await?;

        self.tasks
            .run_and_await(&format!("tag vm {vm_id}"), async {
                let mut tags: BTreeSet<String> = extra_tags
                    .iter()
                    .filter(|tag| !tag.is_empty())
                    .cloned()
                    .collect();
                tags.insert(naming::SESSION_TAG.to_string());
                let joined = tags.into_iter().collect::<Vec<_>>().join(",");
                self.client
                    .request(
                        Method::POST,
                        &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
                        Some(&json!({ "tags": joined })),
                    )
                    .await?;
                Ok(())
            })
            .await
    }

    /// Alias -> vnet id for every aliased vnet on the cluster.
    pub(crate) async fn existing_vnet_aliases(&self) -> Result<HashMap<String, String>> {
        let vnets = self
            .client
            .request(Method::GET, "/cluster/sdn/vnets", None)
            .await?;
        Ok(vnets
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|vnet| {
                let alias = vnet.get("alias").and_then(Value::as_str)?;
                if alias.is_empty() {
                    return None;
                }
                let id = vnet.get("vnet").and_then(Value::as_str)?;
                Some((alias.to_string(), id.to_string()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvebox_core::config::{NicConfig, NicController, VmConfig, VmSource};

    fn session_vnets() -> Vec<VnetHandle> {
        vec![
            VnetHandle {
                id: "abc123v0".into(),
                alias: Some("lan".into()),
            },
            VnetHandle {
                id: "abc123v1".into(),
                alias: None,
            },
        ]
    }

    #[test]
    fn test_default_nics_built_in_binds_first_vnet() {
        let config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        let plan = plan_interfaces(&config, &session_vnets(), &HashMap::new())
            .unwrap()
            .unwrap();
        assert_eq!(
            plan,
            vec![("net0".to_string(), "virtio,bridge=abc123v0".to_string())]
        );
    }

    #[test]
    fn test_default_nics_no_session_vnets_adds_nothing() {
        let config = VmConfig::new(VmSource::Ova("/tmp/x.ova".into()));
        let plan = plan_interfaces(&config, &[], &HashMap::new()).unwrap().unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_default_nics_template_tag_untouched() {
        let config = VmConfig::new(VmSource::ExistingTemplateTag("base".into()));
        let plan = plan_interfaces(&config, &session_vnets(), &HashMap::new()).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_empty_nics_strips_everything() {
        let mut config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        config.nics = Some(vec![]);
        let plan = plan_interfaces(&config, &session_vnets(), &HashMap::new())
            .unwrap()
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_explicit_nics_resolve_in_order() {
        let mut config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        config.nics = Some(vec![
            NicConfig {
                vnet_alias: "wan".into(),
                mac: None,
            },
            NicConfig {
                vnet_alias: "lan".into(),
                mac: Some("02:fc:00:00:00:05".into()),
            },
        ]);
        let existing: HashMap<String, String> =
            [("wan".to_string(), "extern0".to_string())].into();
        let plan = plan_interfaces(&config, &session_vnets(), &existing)
            .unwrap()
            .unwrap();
        assert_eq!(
            plan,
            vec![
                ("net0".to_string(), "virtio,bridge=extern0".to_string()),
                (
                    "net1".to_string(),
                    "virtio,bridge=abc123v0,macaddr=02:fc:00:00:00:05".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_session_alias_wins_over_existing() {
        let mut config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        config.nics = Some(vec![NicConfig {
            vnet_alias: "lan".into(),
            mac: None,
        }]);
        let existing: HashMap<String, String> =
            [("lan".to_string(), "stale0".to_string())].into();
        let plan = plan_interfaces(&config, &session_vnets(), &existing)
            .unwrap()
            .unwrap();
        assert_eq!(plan[0].1, "virtio,bridge=abc123v0");
    }

    #[test]
    fn test_unresolved_alias_is_configuration_error() {
        let mut config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        config.nics = Some(vec![NicConfig {
            vnet_alias: "nowhere".into(),
            mac: None,
        }]);
        let err = plan_interfaces(&config, &session_vnets(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_nic_controller_override() {
        let mut config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        config.nic_controller = Some(NicController::E1000);
        let plan = plan_interfaces(&config, &session_vnets(), &HashMap::new())
            .unwrap()
            .unwrap();
        assert_eq!(plan[0].1, "e1000,bridge=abc123v0");
    }

    #[test]
    fn test_bridge_of() {
        assert_eq!(
            bridge_of("virtio=BC:24:11:3E:C3:BA,bridge=tcc919v0"),
            Some("tcc919v0".to_string())
        );
        assert_eq!(
            bridge_of("e1000,bridge=vmbr0,firewall=1"),
            Some("vmbr0".to_string())
        );
        assert_eq!(bridge_of("virtio=BC:24:11:3E:C3:BA"), None);
    }
}
