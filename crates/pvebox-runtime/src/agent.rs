use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tracing::debug;

use pvebox_api::client::{FileRead, Method, ProxmoxClient};
use pvebox_core::error::{Error, Result};

/// Low-level guest-agent primitives for one node: spawn a process, poll
/// its status, and move file content in and out of the guest.
///
/// The poll primitive is single-read: exactly one status query of a
/// completed pid yields its data, a second query is undefined. Callers
/// must cache the first terminal result.
pub struct GuestAgent {
    client: Arc<ProxmoxClient>,
    node: String,
}

impl GuestAgent {
    pub fn new(client: Arc<ProxmoxClient>, node: &str) -> Self {
        Self {
            client,
            node: node.to_string(),
        }
    }

    pub async fn ping(&self, vm_id: u32) -> Result<()> {
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/agent/ping", self.node),
                None,
            )
            .await?;
        Ok(())
    }

    /// Start a process in the guest; returns its pid.
    pub async fn spawn(&self, vm_id: u32, command: &[String]) -> Result<u64> {
        debug!(vm_id, ?command, "guest exec");
        let data = self
            .client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/agent/exec", self.node),
                Some(&json!({ "command": command })),
            )
            .await?;
        data.get("pid")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Agent("exec response missing pid".into()))
    }

    /// One status poll. See the single-read caveat on [`GuestAgent`].
    pub async fn exec_status(&self, vm_id: u32, pid: u64) -> Result<Value> {
        self.client
            .request(
                Method::GET,
                &format!(
                    "/nodes/{}/qemu/{vm_id}/agent/exec-status?pid={pid}",
                    self.node
                ),
                None,
            )
            .await
    }

    /// Write a file into the guest. The content is base64-encoded before
    /// transmission: raw non-ASCII bytes corrupt inside the transport's
    /// JSON encoding, so `encode=0` plus our own encoding is the only
    /// reliable form.
    pub async fn write_file(&self, vm_id: u32, filepath: &str, content: &[u8]) -> Result<()> {
        debug!(vm_id, filepath, len = content.len(), "guest file write");
        let payload = json!({
            "content": BASE64.encode(content),
            "file": filepath,
            "encode": 0,
        });
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/agent/file-write", self.node),
                Some(&payload),
            )
            .await
            .map_err(|err| map_agent_error(err, filepath))?;
        Ok(())
    }

    /// Bounded file read. Guest-agent "no such file" and "is a directory"
    /// failures map to typed errors; anything else passes through.
    pub async fn read_file(&self, vm_id: u32, filepath: &str, max_size: usize) -> Result<FileRead> {
        self.client
            .read_file_streaming(&self.node, vm_id, filepath, max_size)
            .await
            .map_err(|err| map_agent_error(err, filepath))
    }

    pub async fn create_snapshot(&self, vm_id: u32, name: &str) -> Result<Value> {
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/snapshot", self.node),
                Some(&json!({ "snapname": name, "vmstate": 1 })),
            )
            .await
    }

    pub async fn list_snapshots(&self, vm_id: u32) -> Result<Value> {
        self.client
            .request(
                Method::GET,
                &format!("/nodes/{}/qemu/{vm_id}/snapshot", self.node),
                None,
            )
            .await
    }

    pub async fn snapshot_exists(&self, vm_id: u32, name: &str) -> Result<bool> {
        let snapshots = self.list_snapshots(vm_id).await?;
        Ok(snapshots.as_array().into_iter().flatten().any(|snap| {
            snap.get("name").and_then(Value::as_str) == Some(name)
        }))
    }

    pub async fn rollback_snapshot(&self, vm_id: u32, name: &str) -> Result<()> {
        self.client
            .request(
                Method::POST,
                &format!("/nodes/{}/qemu/{vm_id}/snapshot/{name}/rollback", self.node),
                None,
            )
            .await?;
        Ok(())
    }
}

/// Map guest-agent error bodies onto the typed taxonomy, preserving the
/// distinction between a missing path, a directory target, and everything
/// else.
fn map_agent_error(err: Error, filepath: &str) -> Error {
    if let Error::Transport { body, .. } = &err {
        let lowered = body.to_ascii_lowercase();
        if lowered.contains("no such file or directory") {
            return Error::FileNotFound(filepath.to_string());
        }
        if lowered.contains("is a directory") {
            return Error::IsADirectory(filepath.to_string());
        }
    }
    err
}

/// Decode a JSON-carried guest file body into raw bytes. The transport
/// maps each byte to one codepoint (latin-1), so anything above 0xFF
/// means the payload was not produced by a file read.
pub fn latin1_bytes(content: &str) -> Result<Vec<u8>> {
    content
        .chars()
        .map(|c| {
            let code = c as u32;
            u8::try_from(code)
                .map_err(|_| Error::Agent(format!("non latin-1 codepoint {code:#x} in file body")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_agent_error_no_such_file() {
        let err = Error::Transport {
            status: 500,
            body: "QEMU guest agent error: No such file or directory".into(),
        };
        assert!(matches!(
            map_agent_error(err, "/etc/missing"),
            Error::FileNotFound(path) if path == "/etc/missing"
        ));
    }

    #[test]
    fn test_map_agent_error_is_directory() {
        let err = Error::Transport {
            status: 500,
            body: "Agent error: Is a directory".into(),
        };
        assert!(matches!(
            map_agent_error(err, "/etc"),
            Error::IsADirectory(_)
        ));
    }

    #[test]
    fn test_map_agent_error_passthrough() {
        let err = Error::Transport {
            status: 500,
            body: "something else".into(),
        };
        assert!(matches!(
            map_agent_error(err, "/x"),
            Error::Transport { status: 500, .. }
        ));
    }

    #[test]
    fn test_latin1_bytes_round_trip() {
        let original: Vec<u8> = (0u8..=255).collect();
        let as_text: String = original.iter().map(|&b| b as char).collect();
        assert_eq!(latin1_bytes(&as_text).unwrap(), original);
    }

    #[test]
    fn test_latin1_bytes_rejects_wide_chars() {
        assert!(latin1_bytes("héllo\u{1F600}").is_err());
    }
}
