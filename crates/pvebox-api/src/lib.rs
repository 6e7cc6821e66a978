// pvebox-api: Proxmox VE HTTP transport, async-task synchronization,
// and storage upload helpers.

pub mod client;
pub mod storage;
pub mod tasks;

pub use client::{FileRead, ProxmoxClient};
pub use storage::StorageOps;
pub use tasks::{TaskMonitor, TaskSource};
