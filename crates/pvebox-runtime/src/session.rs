use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Semaphore, SemaphorePermit};

use pvebox_core::error::{Error, Result};

/// Mutable state of one logical provisioning session.
///
/// Holds the set of VM ids and zone ids created by this session (for
/// guaranteed cleanup), the cleanup-done latch, and the size-1 gate that
/// serializes provision/teardown end-to-end — id allocation and CIDR
/// allocation are not internally safe against concurrent callers.
///
/// Constructed fresh per session and passed by reference to every
/// component; never process-global.
#[derive(Debug, Default)]
pub struct ProvisionSession {
    created_vms: Mutex<HashSet<u32>>,
    created_zones: Mutex<HashSet<String>>,
    cleanup_done: AtomicBool,
    gate: OnceSemaphore,
}

/// Semaphore wrapper so `Default` yields a one-permit gate.
#[derive(Debug)]
struct OnceSemaphore(Semaphore);

impl Default for OnceSemaphore {
    fn default() -> Self {
        Self(Semaphore::new(1))
    }
}

impl ProvisionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the session-wide exclusion permit. Held across a whole
    /// provision or teardown flow.
    pub async fn serialize(&self) -> Result<SemaphorePermit<'_>> {
        self.gate
            .0
            .acquire()
            .await
            .map_err(|_| Error::Configuration("session gate closed".into()))
    }

    pub fn register_vm(&self, vm_id: u32) {
        self.created_vms
            .lock()
            .expect("session lock poisoned")
            .insert(vm_id);
    }

    pub fn register_zone(&self, zone_id: &str) {
        self.created_zones
            .lock()
            .expect("session lock poisoned")
            .insert(zone_id.to_string());
    }

    /// Sorted snapshot of the VM ids created so far.
    pub fn vm_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .created_vms
            .lock()
            .expect("session lock poisoned")
            .iter()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn zone_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .created_zones
            .lock()
            .expect("session lock poisoned")
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn cleanup_done(&self) -> bool {
        self.cleanup_done.load(Ordering::SeqCst)
    }

    pub fn mark_cleanup_done(&self) {
        self.cleanup_done.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_snapshot() {
        let session = ProvisionSession::new();
        session.register_vm(102);
        session.register_vm(100);
        session.register_vm(102);
        session.register_zone("abc123z");
        assert_eq!(session.vm_ids(), vec![100, 102]);
        assert_eq!(session.zone_ids(), vec!["abc123z".to_string()]);
    }

    #[test]
    fn test_cleanup_latch() {
        let session = ProvisionSession::new();
        assert!(!session.cleanup_done());
        session.mark_cleanup_done();
        assert!(session.cleanup_done());
    }

    #[tokio::test]
    async fn test_gate_serializes() {
        let session = ProvisionSession::new();
        let permit = session.serialize().await.unwrap();
        // A second acquisition must not be available while held.
        assert!(session.gate.0.try_acquire().is_err());
        drop(permit);
        assert!(session.gate.0.try_acquire().is_ok());
    }
}
