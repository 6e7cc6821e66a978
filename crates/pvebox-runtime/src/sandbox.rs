use std::sync::Arc;

use pvebox_api::client::ProxmoxClient;
use pvebox_api::tasks::TaskMonitor;
use pvebox_core::error::Result;

use crate::agent::GuestAgent;
use crate::exec::{AgentChannel, ExecParams, ExecResult, GuestShell};
use crate::vm::VmManager;

/// One provisioned VM as seen by external callers: command execution,
/// file I/O, snapshot/rollback, and console access.
///
/// Snapshot operations trigger server-side jobs and are wrapped by the
/// task synchronizer; rollback can change running state, so it is
/// followed by a full readiness wait.
pub struct SandboxVm {
    shell: GuestShell<AgentChannel>,
    agent: Arc<GuestAgent>,
    vm: VmManager,
    tasks: TaskMonitor,
    vm_id: u32,
}

impl SandboxVm {
    pub fn new(client: Arc<ProxmoxClient>, node: &str, vm_id: u32) -> Self {
        let agent = Arc::new(GuestAgent::new(client.clone(), node));
        Self {
            shell: GuestShell::new(AgentChannel::new(agent.clone(), vm_id)),
            vm: VmManager::new(client.clone(), node),
            tasks: TaskMonitor::new(client),
            agent,
            vm_id,
        }
    }

    pub fn vm_id(&self) -> u32 {
        self.vm_id
    }

    /// Run a command in the guest; see [`GuestShell::exec`].
    pub async fn exec(&self, command: &[String], params: &ExecParams) -> Result<ExecResult> {
        self.shell.exec(command, params).await
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.shell.write_file(path, contents).await
    }

    pub async fn read_file(&self, path: &str, limit: Option<usize>) -> Result<Vec<u8>> {
        self.shell.read_file(path, limit).await
    }

    pub async fn create_snapshot(&self, name: &str) -> Result<()> {
        self.tasks
            .run_and_await(
                &format!("snapshot {name} of vm {}", self.vm_id),
                self.agent.create_snapshot(self.vm_id, name),
            )
            .await?;
        Ok(())
    }

    pub async fn restore_snapshot(&self, name: &str) -> Result<()> {
        self.tasks
            .run_and_await(
                &format!("rollback vm {} to {name}", self.vm_id),
                self.agent.rollback_snapshot(self.vm_id, name),
            )
            .await?;
        self.vm.await_vm(self.vm_id, true, "running").await?;
        Ok(())
    }

    /// Console URL an operator can open to reach this VM interactively.
    pub fn connection_info(&self) -> String {
        self.vm.connection_url(self.vm_id)
    }
}
