//! Live end-to-end tests against a real Proxmox VE cluster.
//!
//! These are `#[ignore]`d by default; run them explicitly with a cluster
//! configured through the `PROXMOX_*` environment variables:
//!
//! ```text
//! PROXMOX_HOST=pve.lab PROXMOX_PASSWORD=... cargo test -- --ignored
//! ```

use std::sync::Arc;

use pvebox::core::config::{EndpointConfig, SdnRequest, VmConfig, VmSource};
use pvebox::runtime::{ExecParams, ProvisionSession, Provisioner, SandboxVm};

fn endpoint() -> Option<EndpointConfig> {
    if std::env::var_os("PROXMOX_HOST").is_none() {
        return None;
    }
    Some(EndpointConfig::from_env())
}

#[tokio::test]
#[ignore = "requires a live Proxmox cluster"]
async fn provision_exec_and_teardown() {
    let Some(config) = endpoint() else {
        panic!("set PROXMOX_HOST to run live tests");
    };
    let client = Arc::new(pvebox::api::ProxmoxClient::new(&config).unwrap());
    let session = Arc::new(ProvisionSession::new());
    let provisioner = Provisioner::new(client.clone(), &config.node, session.clone());

    provisioner
        .builtins()
        .ensure_exists("ubuntu24.04")
        .await
        .unwrap();

    let vm_config = VmConfig::new(VmSource::BuiltIn("ubuntu24.04".into()));
    let provisioned = provisioner
        .provision("e2e", &SdnRequest::Auto, &[vm_config])
        .await
        .unwrap();
    assert_eq!(provisioned.vms.len(), 1);
    let zone = provisioned.zone_id.clone().unwrap();
    assert!(zone.ends_with('z'));

    let vm_id = provisioned.vms[0].0;
    let sandbox = SandboxVm::new(client, &config.node, vm_id);

    let result = sandbox
        .exec(
            &["echo".to_string(), "-n".to_string(), "hello".to_string()],
            &ExecParams::default(),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.stdout, "hello");

    sandbox
        .write_file("/tmp/e2e-probe", b"probe content")
        .await
        .unwrap();
    let back = sandbox.read_file("/tmp/e2e-probe", None).await.unwrap();
    assert_eq!(back, b"probe content");

    provisioner
        .teardown(Some(zone.as_str()), &[vm_id])
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires a live Proxmox cluster"]
async fn cleanup_by_tag_with_no_resources_is_noop() {
    let Some(config) = endpoint() else {
        panic!("set PROXMOX_HOST to run live tests");
    };
    let client = Arc::new(pvebox::api::ProxmoxClient::new(&config).unwrap());
    let session = Arc::new(ProvisionSession::new());
    let provisioner = Provisioner::new(client, &config.node, session);
    // With nothing tagged, this must complete without destroying
    // anything (and without prompting, since stdin is not a TTY here).
    provisioner.cleanup_by_tag(true).await.unwrap();
}
