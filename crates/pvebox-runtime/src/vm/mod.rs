use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use pvebox_api::client::{Method, ProxmoxClient};
use pvebox_api::storage::StorageOps;
use pvebox_api::tasks::TaskMonitor;
use pvebox_core::error::{Error, Result};
use pvebox_core::retry::Backoff;

use crate::agent::GuestAgent;

mod create;
mod net;

pub(crate) use net::bridge_of;

/// Deadline for one VM state transition (start, stop, delete).
const VM_DEADLINE: Duration = Duration::from_secs(180);

/// First guest-agent probe after boot; kept short so the recovery path
/// kicks in quickly on images with a slow agent unit.
const AGENT_FIRST_PROBE: Duration = Duration::from_secs(30);

/// Second probe after the in-guest restart attempt. Cloud-init images
/// can take minutes to bring the agent up on first boot.
const AGENT_RETRY_PROBE: Duration = Duration::from_secs(180);

/// Outcome of the agent-liveness portion of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentHealth {
    /// The guest agent answered a ping.
    Reachable,
    /// The agent never answered; the VM is up but agent-dependent
    /// functionality (exec, file I/O) will fail.
    Degraded,
    /// Liveness was not probed (non-sandbox VM or non-running target).
    NotProbed,
}

/// State machine driver for individual VMs: create/clone, configure,
/// start, await readiness, destroy.
pub struct VmManager {
    pub(crate) client: Arc<ProxmoxClient>,
    pub(crate) tasks: TaskMonitor,
    pub(crate) agent: Arc<GuestAgent>,
    pub(crate) storage: StorageOps,
    pub(crate) node: String,
}

impl VmManager {
    pub fn new(client: Arc<ProxmoxClient>, node: &str) -> Self {
        Self {
            tasks: TaskMonitor::new(client.clone()),
            agent: Arc::new(GuestAgent::new(client.clone(), node)),
            storage: StorageOps::new(client.clone(), node, "local"),
            client,
            node: node.to_string(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn list_vms(&self) -> Result<Value> {
        self.client
            .request(Method::GET, &format!("/nodes/{}/qemu", self.node), None)
            .await
    }

    pub async fn read_config(&self, vm_id: u32) -> Result<Value> {
        self.client
            .request(
                Method::GET,
                &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
                None,
            )
            .await
    }

    pub async fn status(&self, vm_id: u32) -> Result<String> {
        let current = self
            .client
            .request(
                Method::GET,
                &format!("/nodes/{}/qemu/{vm_id}/status/current", self.node),
                None,
            )
            .await?;
        Ok(current
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string())
    }

    /// Next free numeric VM id. The endpoint returns a string on some
    /// releases and a number on others.
    pub async fn next_vm_id(&self) -> Result<u32> {
        let data = self
            .client
            .request(Method::GET, "/cluster/nextid", None)
            .await?;
        match &data {
            Value::String(text) => text
                .parse()
                .map_err(|_| Error::Configuration(format!("bad nextid response: {text:?}"))),
            Value::Number(number) => number
                .as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| Error::Configuration(format!("bad nextid response: {number}"))),
            other => Err(Error::Configuration(format!(
                "bad nextid response: {other}"
            ))),
        }
    }

    pub async fn start_and_await(&self, vm_id: u32, is_sandbox: bool) -> Result<AgentHealth> {
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/status/start", self.node),
                None,
            )
            .await?;
        self.await_vm(vm_id, is_sandbox, "running").await
    }

    /// Poll the VM until it reports `target` status. Sandbox VMs heading
    /// to "running" additionally get an agent-liveness probe with one
    /// best-effort in-guest recovery; a still-dead agent degrades the
    /// result instead of failing the whole operation.
    pub async fn await_vm(
        &self,
        vm_id: u32,
        is_sandbox: bool,
        target: &str,
    ) -> Result<AgentHealth> {
        Backoff::with_deadline(VM_DEADLINE)
            .poll_until(&format!("vm {vm_id} status {target}"), || async move {
                let status = self.status(vm_id).await?;
                Ok(if status == target { Some(()) } else { None })
            })
            .await?;

        if !(is_sandbox && target == "running") {
            return Ok(AgentHealth::NotProbed);
        }

        if Backoff::with_deadline(AGENT_FIRST_PROBE)
            .retry("agent ping", || async move { self.agent.ping(vm_id).await })
            .await
            .is_ok()
        {
            return Ok(AgentHealth::Reachable);
        }

        info!(vm_id, "guest agent unreachable, attempting in-guest restart");
        // Best-effort: the agent may be dead in a way exec can't fix, and
        // exec itself rides on the agent.
        if let Err(err) = self
            .agent
            .spawn(
                vm_id,
                &[
                    "systemctl".to_string(),
                    "restart".to_string(),
                    "qemu-guest-agent".to_string(),
                ],
            )
            .await
        {
            debug!(vm_id, error = %err, "agent restart attempt failed");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        match Backoff::with_deadline(AGENT_RETRY_PROBE)
            .retry("agent ping after restart", || async move {
                self.agent.ping(vm_id).await
            })
            .await
        {
            Ok(()) => Ok(AgentHealth::Reachable),
            Err(err) => {
                warn!(
                    vm_id,
                    error = %err,
                    "guest agent still unreachable; continuing with degraded agent functionality"
                );
                Ok(AgentHealth::Degraded)
            }
        }
    }

    /// Stop, await stopped, delete, await gone — each phase with its own
    /// deadline. The verify step tolerates a VM already deleted by a
    /// concurrent actor; a delete that fails outright propagates (leaving
    /// the VM leaked would be worse than failing loudly).
    pub async fn destroy(&self, vm_id: u32) -> Result<()> {
        info!(vm_id, "stopping VM");
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/status/stop", self.node),
                None,
            )
            .await?;

        Backoff::with_deadline(VM_DEADLINE)
            .poll_until(&format!("vm {vm_id} stopped"), || async move {
                let status = self.status(vm_id).await?;
                Ok(if status == "stopped" { Some(()) } else { None })
            })
            .await?;

        info!(vm_id, "deleting VM");
        self.client
            .request(
                Method::DELETE,
                &format!("/nodes/{}/qemu/{vm_id}", self.node),
                None,
            )
            .await?;

        Backoff::with_deadline(VM_DEADLINE)
            .poll_until(&format!("vm {vm_id} deleted"), || async move {
                let current = self
                    .client
                    .request_lenient(
                        Method::GET,
                        &format!("/nodes/{}/qemu/{vm_id}/status/current", self.node),
                    )
                    .await?;
                Ok(if current.get("vmid").is_some() {
                    None
                } else {
                    Some(())
                })
            })
            .await?;
        Ok(())
    }

    /// Console URL for interactive access to a VM.
    pub fn connection_url(&self, vm_id: u32) -> String {
        format!(
            "{}/?console=kvm&novnc=1&vmid={vm_id}&node={}",
            self.client.base_url(),
            self.node
        )
    }
}

/// True when the listing entry carries `tag` in its `;`-separated tags.
pub(crate) fn vm_has_tag(vm: &Value, tag: &str) -> bool {
    vm.get("tags")
        .and_then(Value::as_str)
        .map(|tags| tags.split(';').any(|entry| entry == tag))
        .unwrap_or(false)
}

/// True when the listing entry is a template.
pub(crate) fn vm_is_template(vm: &Value) -> bool {
    vm.get("template").and_then(Value::as_i64) == Some(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vm_has_tag() {
        let vm = json!({"vmid": 100, "tags": "inspect;builtin-ubuntu24.04"});
        assert!(vm_has_tag(&vm, "inspect"));
        assert!(vm_has_tag(&vm, "builtin-ubuntu24.04"));
        assert!(!vm_has_tag(&vm, "builtin"));
        assert!(!vm_has_tag(&json!({"vmid": 100}), "inspect"));
    }

    #[test]
    fn test_vm_is_template() {
        assert!(vm_is_template(&json!({"template": 1})));
        assert!(!vm_is_template(&json!({"template": 0})));
        assert!(!vm_is_template(&json!({})));
    }
}
