use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

use pvebox_core::error::{Error, Result};
use pvebox_core::limits::{AGENT_READ_CEILING, EXEC_OUTPUT_LIMIT, READ_FILE_LIMIT, WRITE_CHUNK_SIZE};
use pvebox_core::retry::Backoff;

use crate::agent::{GuestAgent, latin1_bytes};

/// Default wall-clock limit for a guest command.
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;

/// Extra poll budget past the in-guest `timeout` so the 124 sentinel can
/// land in the returncode marker before the poll loop gives up (covers
/// the SIGTERM-then-SIGKILL grace window).
const EXEC_POLL_GRACE: Duration = Duration::from_secs(15);

/// How long to wait for the returncode marker before treating the run as
/// timed out.
const RETURNCODE_DEADLINE: Duration = Duration::from_secs(2);

/// Terminal state of a guest process, as reported by a single successful
/// poll.
#[derive(Debug, Clone)]
pub struct ExecStatus {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// The narrow guest-side primitive surface the exec protocol is built
/// on. The production implementation drives the hypervisor's guest
/// agent; tests substitute an in-process guest.
#[async_trait]
pub trait GuestChannel: Send + Sync {
    async fn spawn(&self, command: &[String]) -> Result<u64>;

    /// `None` while the process is running. Exactly one poll of a
    /// completed process yields its data; a second poll of the same pid
    /// is undefined — cache the first terminal result.
    async fn poll(&self, pid: u64) -> Result<Option<ExecStatus>>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Bounded read; exceeding `max_size` is `OutputTooLarge` carrying
    /// salvageable partial content.
    async fn read_file(&self, path: &str, max_size: usize) -> Result<Vec<u8>>;
}

/// Production [`GuestChannel`] addressing one VM through the guest agent.
pub struct AgentChannel {
    agent: Arc<GuestAgent>,
    vm_id: u32,
}

impl AgentChannel {
    pub fn new(agent: Arc<GuestAgent>, vm_id: u32) -> Self {
        Self { agent, vm_id }
    }
}

#[async_trait]
impl GuestChannel for AgentChannel {
    async fn spawn(&self, command: &[String]) -> Result<u64> {
        self.agent.spawn(self.vm_id, command).await
    }

    async fn poll(&self, pid: u64) -> Result<Option<ExecStatus>> {
        let status = self.agent.exec_status(self.vm_id, pid).await?;
        if status.get("exited").and_then(serde_json::Value::as_i64) != Some(1) {
            return Ok(None);
        }
        Ok(Some(ExecStatus {
            exit_code: status
                .get("exitcode")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(-1),
            stdout: status
                .get("out-data")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string(),
            stderr: status
                .get("err-data")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string(),
        }))
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        self.agent.write_file(self.vm_id, path, content).await
    }

    async fn read_file(&self, path: &str, max_size: usize) -> Result<Vec<u8>> {
        let read = self.agent.read_file(self.vm_id, path, max_size).await?;
        if read.truncated || read.content.len() >= max_size {
            return Err(Error::OutputTooLarge {
                limit: max_size,
                partial: read.content,
            });
        }
        latin1_bytes(&read.content)
    }
}

/// Exec request options.
#[derive(Debug, Clone, Default)]
pub struct ExecParams {
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    /// Wall-clock limit in seconds; defaults to 30.
    pub timeout: Option<u64>,
}

/// Outcome of a command that actually ran (possibly unsuccessfully).
/// Commands that could not run at all surface as typed errors instead.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub returncode: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Synchronous-looking command execution and chunked file transfer over
/// an asynchronous guest byte channel.
pub struct GuestShell<C> {
    channel: C,
}

impl<C: GuestChannel> GuestShell<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Run a command in the guest and collect exit code, stdout, and
    /// stderr through marker files.
    pub async fn exec(&self, command: &[String], params: &ExecParams) -> Result<ExecResult> {
        let tmp_start = scratch_prefix("exec");
        let script = build_shell_script(&tmp_start, command, params)?;

        self.channel
            .write_file(&format!("{tmp_start}script.sh"), script.as_bytes())
            .await?;
        let pid = self
            .channel
            .spawn(&["sh".to_string(), format!("{tmp_start}script.sh")])
            .await?;

        let timeout = params.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
        let poll_deadline = Duration::from_secs(timeout) + EXEC_POLL_GRACE;
        let status = Backoff::with_deadline(poll_deadline)
            .poll_until("guest command completion", || async move {
                self.channel.poll(pid).await
            })
            .await?;

        let result = if !status.stderr.is_empty() {
            // The wrapper script itself failed (e.g. unknown user) before
            // redirection started; its own output is the best diagnostic.
            ExecResult {
                success: false,
                returncode: status.exit_code,
                stdout: status.stdout,
                stderr: status.stderr,
            }
        } else {
            let stdout = self.read_marker(&format!("{tmp_start}script.stdout")).await?;
            let stderr = self.read_marker(&format!("{tmp_start}script.stderr")).await?;
            let returncode = self.read_returncode(&tmp_start).await;
            ExecResult {
                success: returncode == 0,
                returncode,
                stdout,
                stderr,
            }
        };

        // Best-effort marker cleanup; never worth failing the exec over.
        if let Err(err) = self
            .channel
            .spawn(&[
                "sh".to_string(),
                "-c".to_string(),
                format!("rm -f {tmp_start}*"),
            ])
            .await
        {
            debug!(error = %err, "marker cleanup failed");
        }

        if result.returncode == 124 {
            return Err(Error::ExecTimeout);
        }
        if result.returncode == 126
            && result.stderr.lines().count() == 1
            && result.stderr.to_ascii_lowercase().contains("permission denied")
        {
            // A single stderr line means nothing past the first command
            // ran: the file could not be executed at all, as opposed to
            // running and printing to stderr.
            return Err(Error::PermissionDenied(result.stderr.trim().to_string()));
        }

        Ok(result)
    }

    async fn read_marker(&self, path: &str) -> Result<String> {
        match self.channel.read_file(path, EXEC_OUTPUT_LIMIT).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(Error::FileNotFound(_)) => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    /// The returncode marker is written last; give it a short grace
    /// window. A run that never produced one is indistinguishable from a
    /// kill at the deadline, so it reads as the timeout sentinel.
    async fn read_returncode(&self, tmp_start: &str) -> i64 {
        let path = format!("{tmp_start}script.returncode");
        let read = Backoff::with_deadline(RETURNCODE_DEADLINE)
            .retry("returncode marker", || {
                let path = path.clone();
                async move {
                    let bytes = match self.channel.read_file(&path, EXEC_OUTPUT_LIMIT).await {
                        Ok(bytes) => bytes,
                        Err(Error::FileNotFound(_)) => Vec::new(),
                        Err(err) => return Err(err),
                    };
                    let text = String::from_utf8_lossy(&bytes);
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        return Err(Error::Agent("returncode marker is empty".into()));
                    }
                    trimmed
                        .parse::<i64>()
                        .map_err(|_| Error::Agent(format!("bad returncode marker: {trimmed:?}")))
                }
            })
            .await;
        read.unwrap_or(124)
    }

    /// Write `contents` to `path`, chunking payloads above the direct
    /// transport ceiling through a scratch directory and reassembling
    /// with a generated script. The full payload is never held in one
    /// oversized request.
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let parent = parent_dir(path);
        self.exec(
            &[
                "mkdir".to_string(),
                "-p".to_string(),
                "--".to_string(),
                parent,
            ],
            &ExecParams::default(),
        )
        .await?;

        if contents.len() <= WRITE_CHUNK_SIZE {
            return self.channel.write_file(path, contents).await;
        }

        let chunks: Vec<&[u8]> = contents.chunks(WRITE_CHUNK_SIZE).collect();
        let padding_width = (chunks.len() - 1).to_string().len();
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let scratch_dir = format!("{}split_{file_name}", scratch_prefix("write"));

        let assembled = self
            .write_chunked(path, &chunks, padding_width, &scratch_dir)
            .await;

        // The scratch directory goes away even when reassembly failed.
        if let Err(err) = self
            .exec(
                &[
                    "rm".to_string(),
                    "-rf".to_string(),
                    scratch_dir.clone(),
                ],
                &ExecParams::default(),
            )
            .await
        {
            debug!(%scratch_dir, error = %err, "scratch cleanup failed");
        }

        assembled
    }

    async fn write_chunked(
        &self,
        path: &str,
        chunks: &[&[u8]],
        padding_width: usize,
        scratch_dir: &str,
    ) -> Result<()> {
        self.exec(
            &[
                "mkdir".to_string(),
                "-p".to_string(),
                "--".to_string(),
                scratch_dir.to_string(),
            ],
            &ExecParams::default(),
        )
        .await?;

        for (index, chunk) in chunks.iter().enumerate() {
            let chunk_path = format!("{scratch_dir}/chunk_{index:0padding_width$}");
            self.channel.write_file(&chunk_path, chunk).await?;
        }

        let combine = format!(
            "rm -f {path}\n\
             for i in $(seq -f \"%0{padding_width}.0f\" 0 {last}); do\n  \
             cat \"{scratch_dir}/chunk_$i\" >> {path}\ndone\n",
            last = chunks.len() - 1,
        );
        let combine_path = format!("{scratch_dir}/combine.sh");
        self.channel
            .write_file(&combine_path, combine.as_bytes())
            .await?;

        let combined = self
            .exec(
                &["sh".to_string(), combine_path],
                &ExecParams::default(),
            )
            .await?;
        if !combined.success {
            return Err(Error::Agent(format!(
                "chunk reassembly failed with code {}: {}",
                combined.returncode, combined.stderr
            )));
        }
        Ok(())
    }

    /// Bounded whole-file read. The effective cap is the smaller of the
    /// transport's hard ceiling and the caller's limit.
    pub async fn read_file(&self, path: &str, limit: Option<usize>) -> Result<Vec<u8>> {
        let cap = AGENT_READ_CEILING.min(limit.unwrap_or(READ_FILE_LIMIT));
        self.channel.read_file(path, cap).await
    }
}

/// Unique guest-side scratch prefix for one protocol run.
fn scratch_prefix(kind: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("/tmp/pvebox_{kind}_{nanos}_")
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

fn quote(word: &str) -> Result<String> {
    shlex::try_quote(word)
        .map(|q| q.into_owned())
        .map_err(|_| Error::Configuration(format!("cannot shell-quote {word:?}")))
}

/// Assemble the wrapper script for one exec.
///
/// The layout mirrors what the protocol needs to survive a hostile
/// command line: marker files are cleared up front, a `su` layer (when
/// requested) wraps the remainder in a heredoc so metacharacters in the
/// command never reach the outer shell, stdin arrives through a base64
/// decode stage, and the command runs under `timeout` with its streams
/// redirected into the markers.
fn build_shell_script(tmp_start: &str, command: &[String], params: &ExecParams) -> Result<String> {
    let mut script = String::new();
    script.push_str(&format!(
        "rm -f {tmp_start}script.stdout {tmp_start}script.stderr {tmp_start}script.returncode\n"
    ));
    if let Some(user) = &params.user {
        script.push_str(&format!("su -l {} << 'EOF{tmp_start}EOF'\n", quote(user)?));
    }
    if let Some(cwd) = &params.cwd {
        script.push_str(&format!("cd {} || exit $?\n", quote(cwd)?));
    }
    for (key, value) in &params.env {
        script.push_str(&format!("export {}={}\n", quote(key)?, quote(value)?));
    }

    if let Some(stdin) = &params.stdin {
        // Base64 tolerates binary stdin and embedded newlines that would
        // otherwise terminate the pipe early.
        script.push_str(&format!("echo '{}' | base64 -d | ", BASE64.encode(stdin)));
    }
    if let Some(timeout) = params.timeout {
        // -k 5s sends SIGKILL after a grace window in case the command
        // ignores SIGTERM.
        script.push_str(&format!("timeout -k 5s {timeout}s "));
    }
    let words: Vec<&str> = command.iter().map(String::as_str).collect();
    let joined = shlex::try_join(words)
        .map_err(|_| Error::Configuration("cannot shell-quote command".into()))?;
    script.push_str(&joined);
    script.push_str(&format!(
        " >{tmp_start}script.stdout 2>{tmp_start}script.stderr\n"
    ));
    script.push_str(&format!("echo -n \"$?\" > {tmp_start}script.returncode\n"));
    script.push_str("sync\n");
    if params.user.is_some() {
        script.push_str(&format!("EOF{tmp_start}EOF\n"));
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_script_clears_markers_first() {
        let script =
            build_shell_script("/tmp/t_", &cmd(&["true"]), &ExecParams::default()).unwrap();
        let first_line = script.lines().next().unwrap();
        assert_eq!(
            first_line,
            "rm -f /tmp/t_script.stdout /tmp/t_script.stderr /tmp/t_script.returncode"
        );
        assert!(script.contains("true >/tmp/t_script.stdout 2>/tmp/t_script.stderr\n"));
        assert!(script.contains("echo -n \"$?\" > /tmp/t_script.returncode\n"));
        assert!(script.ends_with("sync\n"));
    }

    #[test]
    fn test_script_quotes_command_words() {
        let script = build_shell_script(
            "/tmp/t_",
            &cmd(&["echo", "hello world"]),
            &ExecParams::default(),
        )
        .unwrap();
        // The space-bearing word must arrive quoted, whatever quoting
        // style the joiner picks.
        assert!(!script.contains("echo hello world"));
        assert!(script.contains("hello world"));
    }

    #[test]
    fn test_script_user_heredoc_wraps_remainder() {
        let params = ExecParams {
            user: Some("worker".into()),
            cwd: Some("/srv".into()),
            ..Default::default()
        };
        let script = build_shell_script("/tmp/t_", &cmd(&["id"]), &params).unwrap();
        let su_pos = script.find("su -l worker << 'EOF/tmp/t_EOF'").unwrap();
        let cd_pos = script.find("cd /srv || exit $?").unwrap();
        assert!(su_pos < cd_pos);
        assert!(script.trim_end().ends_with("EOF/tmp/t_EOF"));
    }

    #[test]
    fn test_script_env_exports_are_quoted() {
        let params = ExecParams {
            env: vec![("GREETING".into(), "hello world".into())],
            ..Default::default()
        };
        let script = build_shell_script("/tmp/t_", &cmd(&["true"]), &params).unwrap();
        let line = script
            .lines()
            .find(|l| l.starts_with("export GREETING="))
            .unwrap();
        assert_ne!(line, "export GREETING=hello world");
        assert!(line.contains("hello world"));
    }

    #[test]
    fn test_script_stdin_pipes_through_base64() {
        let params = ExecParams {
            stdin: Some(b"line1\nline2".to_vec()),
            ..Default::default()
        };
        let script = build_shell_script("/tmp/t_", &cmd(&["cat"]), &params).unwrap();
        let encoded = BASE64.encode(b"line1\nline2");
        assert!(script.contains(&format!("echo '{encoded}' | base64 -d | cat")));
    }

    #[test]
    fn test_script_timeout_prefix_after_stdin_pipe() {
        let params = ExecParams {
            stdin: Some(b"x".to_vec()),
            timeout: Some(7),
            ..Default::default()
        };
        let script = build_shell_script("/tmp/t_", &cmd(&["cat"]), &params).unwrap();
        assert!(script.contains("| timeout -k 5s 7s cat"));
    }

    #[test]
    fn test_script_no_timeout_without_limit() {
        let script =
            build_shell_script("/tmp/t_", &cmd(&["true"]), &ExecParams::default()).unwrap();
        assert!(!script.contains("timeout"));
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/var/tmp/file"), "/var/tmp");
        assert_eq!(parent_dir("/file"), "/");
        assert_eq!(parent_dir("file"), ".");
    }

    #[test]
    fn test_scratch_prefix_unique() {
        let first = scratch_prefix("exec");
        std::thread::sleep(Duration::from_millis(2));
        assert_ne!(first, scratch_prefix("exec"));
    }
}
