use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cidr::Cidr;

/// Connection settings for one hypervisor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub realm: String,
    pub password: String,
    pub node: String,
    pub verify_tls: bool,
}

impl EndpointConfig {
    /// Read endpoint settings from `PROXMOX_*` environment variables,
    /// with the usual lab defaults.
    pub fn from_env() -> Self {
        Self {
            host: env_or("PROXMOX_HOST", "localhost"),
            port: env_or("PROXMOX_PORT", "8006").parse().unwrap_or(8006),
            user: env_or("PROXMOX_USER", "root"),
            realm: env_or("PROXMOX_REALM", "pam"),
            password: env_or("PROXMOX_PASSWORD", "password"),
            node: env_or("PROXMOX_NODE", "proxmox"),
            verify_tls: env_or("PROXMOX_VERIFY_TLS", "1") == "1",
        }
    }

    /// Login username in `user@realm` form.
    pub fn username(&self) -> String {
        format!("{}@{}", self.user, self.realm)
    }

    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// A DHCP lease range within a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl DhcpRange {
    /// Wire form expected by the SDN subnet endpoint.
    pub fn to_api_format(&self) -> String {
        format!("start-address={},end-address={}", self.start, self.end)
    }
}

/// A subnet within a vnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetConfig {
    pub cidr: Cidr,
    pub gateway: IpAddr,
    pub snat: bool,
    #[serde(default)]
    pub dhcp_ranges: Vec<DhcpRange>,
}

/// A virtual network bridge plus its subnets. The alias links VM NIC
/// configs to the vnet that will be created for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnetConfig {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub subnets: Vec<SubnetConfig>,
}

/// Explicit software-defined-network layout for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdnConfig {
    pub vnets: Vec<VnetConfig>,
    /// Whether the platform manages IPAM/DHCP. When set, every subnet
    /// must carry DHCP ranges; when unset, none may.
    #[serde(default = "default_true")]
    pub use_pve_ipam_dnsmasq: bool,
}

/// What kind of network the session wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdnRequest {
    /// Synthesize one vnet on a random free /24.
    Auto,
    /// Create nothing; VM NICs may reference pre-existing vnets by alias.
    UseExisting,
    /// Caller-specified layout.
    Custom(SdnConfig),
}

/// Where a VM comes from. Exactly one source, enforced by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmSource {
    /// A provider-managed template, e.g. `ubuntu24.04`.
    BuiltIn(String),
    /// A local disk-image archive to import.
    Ova(PathBuf),
    /// An existing template carrying this tag.
    ExistingTemplateTag(String),
}

/// One VM network interface bound to a vnet by alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    pub vnet_alias: String,
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskController {
    Scsi,
    Ide,
}

impl DiskController {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskController::Scsi => "scsi",
            DiskController::Ide => "ide",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicController {
    Virtio,
    E1000,
}

impl NicController {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicController::Virtio => "virtio",
            NicController::E1000 => "e1000",
        }
    }
}

/// Guest OS type hint, as understood by the hypervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    L24,
    #[default]
    L26,
    Other,
    Solaris,
    W2k,
    W2k3,
    W2k8,
    Win7,
    Win8,
    Win10,
    Win11,
    Wvista,
    Wxp,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::L24 => "l24",
            OsType::L26 => "l26",
            OsType::Other => "other",
            OsType::Solaris => "solaris",
            OsType::W2k => "w2k",
            OsType::W2k3 => "w2k3",
            OsType::W2k8 => "w2k8",
            OsType::Win7 => "win7",
            OsType::Win8 => "win8",
            OsType::Win10 => "win10",
            OsType::Win11 => "win11",
            OsType::Wvista => "wvista",
            OsType::Wxp => "wxp",
        }
    }
}

/// Declarative VM description.
///
/// `nics` is three-state: `None` leaves networking to the source defaults
/// (first session vnet for built-in/OVA sources, untouched otherwise);
/// `Some(vec![])` deliberately strips every NIC; explicit entries attach
/// in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub source: VmSource,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_ram_mb")]
    pub ram_mb: u64,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default)]
    pub nics: Option<Vec<NicConfig>>,
    /// Sandbox VMs must run the guest agent; readiness waits probe it.
    #[serde(default = "default_true")]
    pub is_sandbox: bool,
    #[serde(default)]
    pub uefi_boot: bool,
    /// Only honored for OVA sources.
    #[serde(default)]
    pub disk_controller: Option<DiskController>,
    #[serde(default)]
    pub nic_controller: Option<NicController>,
    /// Only honored for OVA sources.
    #[serde(default)]
    pub os_type: OsType,
}

impl VmConfig {
    pub fn new(source: VmSource) -> Self {
        Self {
            source,
            name: None,
            ram_mb: default_ram_mb(),
            vcpus: default_vcpus(),
            nics: None,
            is_sandbox: true,
            uefi_boot: false,
            disk_controller: None,
            nic_controller: None,
            os_type: OsType::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ram_mb() -> u64 {
    2048
}

fn default_vcpus() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_config_defaults() {
        let cfg = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
        assert_eq!(cfg.ram_mb, 2048);
        assert_eq!(cfg.vcpus, 2);
        assert!(cfg.is_sandbox);
        assert!(cfg.nics.is_none());
        assert_eq!(cfg.os_type, OsType::L26);
    }

    #[test]
    fn test_vm_config_serde_defaults() {
        let cfg: VmConfig = serde_json::from_str(
            r#"{"source": {"built_in": "ubuntu24.04"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.ram_mb, 2048);
        assert!(cfg.is_sandbox);
        assert!(cfg.nics.is_none());
    }

    #[test]
    fn test_nics_three_states_survive_serde() {
        let untouched: VmConfig =
            serde_json::from_str(r#"{"source": {"built_in": "ubuntu24.04"}}"#).unwrap();
        assert!(untouched.nics.is_none());

        let stripped: VmConfig =
            serde_json::from_str(r#"{"source": {"built_in": "ubuntu24.04"}, "nics": []}"#).unwrap();
        assert_eq!(stripped.nics, Some(vec![]));
    }

    #[test]
    fn test_vm_source_exactly_one() {
        // The closed enum cannot express zero or two sources; a payload
        // with two keys fails to deserialize.
        let result: std::result::Result<VmSource, _> = serde_json::from_str(
            r#"{"built_in": "ubuntu24.04", "existing_template_tag": "x"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_dhcp_range_api_format() {
        let range = DhcpRange {
            start: "192.168.2.50".parse().unwrap(),
            end: "192.168.2.100".parse().unwrap(),
        };
        assert_eq!(
            range.to_api_format(),
            "start-address=192.168.2.50,end-address=192.168.2.100"
        );
    }

    #[test]
    fn test_endpoint_username() {
        let cfg = EndpointConfig {
            host: "pve.local".into(),
            port: 8006,
            user: "root".into(),
            realm: "pam".into(),
            password: "secret".into(),
            node: "proxmox".into(),
            verify_tls: true,
        };
        assert_eq!(cfg.username(), "root@pam");
        assert_eq!(cfg.base_url(), "https://pve.local:8006");
    }

    #[test]
    fn test_sdn_config_ipam_default() {
        let cfg: SdnConfig = serde_json::from_str(r#"{"vnets": []}"#).unwrap();
        assert!(cfg.use_pve_ipam_dnsmasq);
    }
}
