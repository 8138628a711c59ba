//! Per-conversation Docker sandbox (§4.4).
//!
//! A [`Sandbox`] is a single long-lived `docker run -i ... /bin/cat -`
//! holder process keeping a container alive; individual commands run inside
//! it via `docker exec`. Grounded on
//! `examples/original_source/llmulink/sandbox/sandbox.py` (the `execute`
//! multiplexing loop and 120s timeout-with-extension) and
//! `svc_sandbox.py` (tempdir-under-configured-path provisioning) — the
//! latter's `init_sandbox` never actually starts the `docker_process`
//! `Sandbox.__init__` requires, which this module resolves by having
//! `Sandbox::provision` start and hold that process itself. Subprocess
//! multiplexing style (concurrent stdout/stderr pumps, `BashError`-shaped
//! error enum) follows `src/cloudllm/tools/bash.rs`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::Instant;
use uuid::Uuid;

const SANDBOX_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_IMAGE: &str = "alpine:latest";
const SANDBOX_USER: &str = "1000000:1000000";

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Parent directory under which a per-conversation tempdir is created
    /// and bind-mounted at `/sandbox` in the container.
    pub path: PathBuf,
    pub image: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/cloudllm-sandboxes"),
            image: DEFAULT_IMAGE.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum SandboxError {
    Io(std::io::Error),
    MissingStream(&'static str),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Io(e) => write!(f, "sandbox io error: {}", e),
            SandboxError::MissingStream(name) => write!(f, "sandbox process has no {} pipe", name),
        }
    }
}

impl std::error::Error for SandboxError {}

/// Result of one `execute` call once the subprocess has exited: the exit
/// code and whether the 120s timeout fired at least once. Stdout/stderr
/// themselves are not accumulated here — they are streamed line-by-line to
/// the caller's callback as they arrive.
#[derive(Debug, Default)]
pub struct SandboxOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
}

/// A live sandbox: a tempdir mounted into a held-alive container.
pub struct Sandbox {
    name: String,
    tempdir: TempDir,
    holder: tokio::sync::Mutex<Child>,
}

impl Sandbox {
    /// Create a fresh tempdir under `config.path` and start the holder
    /// container with it bind-mounted at `/sandbox`. Mirrors
    /// `SandboxService.init_sandbox`'s tempdir step plus the container start
    /// that step never performed.
    pub async fn provision(config: &SandboxConfig) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(&config.path).await.map_err(SandboxError::Io)?;
        let tempdir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&config.path)
            .map_err(SandboxError::Io)?;
        let name = format!("cloudllm-sandbox-{}", Uuid::new_v4().simple());
        let mount = format!("{}:/sandbox", tempdir.path().display());

        let holder = TokioCommand::new("/usr/bin/docker")
            .args([
                "run", "--rm", "-i", "--name", &name, "--user", SANDBOX_USER, "-v", &mount, &config.image, "/bin/cat", "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(SandboxError::Io)?;

        Ok(Self {
            name,
            tempdir,
            holder: tokio::sync::Mutex::new(holder),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        self.tempdir.path()
    }

    /// Tear down the holder container. `--rm` reclaims it once it exits;
    /// closing stdin is what makes `/bin/cat -` exit.
    pub async fn shutdown(&self) {
        let mut holder = self.holder.lock().await;
        if let Some(stdin) = holder.stdin.take() {
            drop(stdin);
        }
        let _ = holder.wait().await;
    }

    /// Run `cmd` inside the held container via `docker exec`, optionally
    /// piping `stdin`, multiplexing stdout/stderr/exit concurrently with a
    /// 120s timeout that sends a kill signal and keeps waiting (mirrors the
    /// original's `process.terminate()` + extended deadline; Rust's portable
    /// `Child::start_kill` sends a stronger signal than `SIGTERM` on Unix,
    /// since there is no cross-platform SIGTERM in `tokio::process`).
    ///
    /// `on_line` is called once per stdout/stderr line as it arrives, mirroring
    /// the original's `async for r1, r2 in sandbox.execute(...)` progress loop
    /// (`tool_busybox.py:34-41`) rather than returning the whole output at once.
    pub async fn execute<F, Fut>(&self, cmd: &[String], stdin: Option<&str>, mut on_line: F) -> Result<SandboxOutcome, SandboxError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        log::info!("executing command in sandbox {}: {:?}", self.name, cmd);

        let mut command = TokioCommand::new("/usr/bin/docker");
        command.arg("exec").arg("--interactive").arg(&self.name).args(cmd);
        command.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(SandboxError::Io)?;

        if let Some(input) = stdin {
            let mut child_stdin = child.stdin.take().ok_or(SandboxError::MissingStream("stdin"))?;
            child_stdin.write_all(input.as_bytes()).await.map_err(SandboxError::Io)?;
            drop(child_stdin);
        }

        let stdout = child.stdout.take().ok_or(SandboxError::MissingStream("stdout"))?;
        let stderr = child.stderr.take().ok_or(SandboxError::MissingStream("stderr"))?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut outcome = SandboxOutcome::default();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut exit_code = None;
        let mut deadline = Instant::now() + SANDBOX_TIMEOUT;

        while exit_code.is_none() || !stdout_done || !stderr_done {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline), if exit_code.is_none() => {
                    log::warn!("sandbox execution in {} timed out, terminating", self.name);
                    outcome.timed_out = true;
                    deadline = Instant::now() + SANDBOX_TIMEOUT;
                    let _ = child.start_kill();
                }
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line.map_err(SandboxError::Io)? {
                        Some(text) => on_line(format!("{}\n", text)).await,
                        None => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line.map_err(SandboxError::Io)? {
                        Some(text) => on_line(format!("{}\n", text)).await,
                        None => stderr_done = true,
                    }
                }
                status = child.wait(), if exit_code.is_none() => {
                    let status = status.map_err(SandboxError::Io)?;
                    exit_code = Some(status.code().unwrap_or(-1));
                }
            }
        }

        outcome.exit_code = exit_code.unwrap_or(-1);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_alpine_and_the_shared_tempdir_root() {
        let config = SandboxConfig::default();
        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.path, PathBuf::from("/tmp/cloudllm-sandboxes"));
    }

    #[test]
    fn missing_stream_error_names_the_stream() {
        let err = SandboxError::MissingStream("stdout");
        assert_eq!(err.to_string(), "sandbox process has no stdout pipe");
    }

    #[test]
    fn io_error_is_wrapped_with_context() {
        let err = SandboxError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "docker missing"));
        assert!(err.to_string().contains("docker missing"));
    }
}
