/// Hard ceiling on a single guest-agent file read. The hypervisor API
/// refuses to return more than 16 MiB from `agent/file-read`.
pub const AGENT_READ_CEILING: usize = 16 * 1024 * 1024;

/// Cap on exec stdout/stderr read back from marker files.
pub const EXEC_OUTPUT_LIMIT: usize = 10 * 1024 * 1024;

/// Default cap for whole-file reads when the caller does not shrink it.
pub const READ_FILE_LIMIT: usize = 100 * 1024 * 1024;

/// Direct guest-write ceiling; larger payloads are chunked. The agent
/// transport rejects writes around 60 KiB once base64 overhead lands, so
/// chunks stay well under that.
pub const WRITE_CHUNK_SIZE: usize = 40 * 1024;
