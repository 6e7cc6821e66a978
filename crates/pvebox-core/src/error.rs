use std::time::Duration;

/// Error taxonomy for the provisioning engine.
///
/// Transient remote-state inconsistencies (job not yet visible, VM not yet
/// in target status, agent not yet reachable) are retried with backoff by
/// callers and only surface as [`Error::ProvisioningTimeout`] once their
/// deadline lapses. Structural errors (`Configuration`, `NotFound`,
/// `Ambiguous`) fail immediately and are never retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Non-2xx HTTP response from the hypervisor API.
    #[error("HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// Network-level failure before any status code was available.
    #[error("transport error: {0}")]
    Network(String),

    /// A bounded wait elapsed without the remote side reaching the
    /// expected state. `last` records the most recent observation.
    #[error("timed out after {after:?} waiting for {operation}: {last}")]
    ProvisioningTimeout {
        operation: String,
        after: Duration,
        last: String,
    },

    /// Invalid or ambiguous input; surfaced immediately, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous: {0}")]
    Ambiguous(String),

    /// The auto allocator exhausted its candidate subnet space.
    #[error("no free address space for a new subnet")]
    NoFreeAddressSpace,

    /// Output exceeded a size cap. Carries whatever partial content could
    /// be salvaged before the read was abandoned.
    #[error("output exceeds {limit} byte limit")]
    OutputTooLarge { limit: usize, partial: String },

    /// The guest command hit its wall-clock timeout (exit code 124).
    #[error("command timed out in guest")]
    ExecTimeout,

    /// The command could not be run at all, as opposed to running and
    /// printing to stderr.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Guest-agent error passed through unmodified.
    #[error("guest agent: {0}")]
    Agent(String),

    #[error("no such file in guest: {0}")]
    FileNotFound(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for HTTP failures whose body or status indicates the target
    /// object is already absent. Used by idempotent teardown paths.
    pub fn is_gone(&self) -> bool {
        match self {
            Error::Transport { status: 404, .. } => true,
            Error::Transport { body, .. } => {
                let body = body.to_ascii_lowercase();
                body.contains("does not exist") || body.contains("no such")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_gone_on_404() {
        let err = Error::Transport {
            status: 404,
            body: String::new(),
        };
        assert!(err.is_gone());
    }

    #[test]
    fn test_is_gone_on_body_match() {
        let err = Error::Transport {
            status: 500,
            body: "zone 'abc123z' does not exist".into(),
        };
        assert!(err.is_gone());
    }

    #[test]
    fn test_is_gone_negative() {
        let err = Error::Transport {
            status: 500,
            body: "internal error".into(),
        };
        assert!(!err.is_gone());
        assert!(!Error::ExecTimeout.is_gone());
    }

    #[test]
    fn test_timeout_display_includes_operation() {
        let err = Error::ProvisioningTimeout {
            operation: "vm 101 running".into(),
            after: Duration::from_secs(180),
            last: "status stopped".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("vm 101 running"));
        assert!(msg.contains("status stopped"));
    }
}
