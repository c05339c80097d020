//! Parent side: start a detached daemon and wait for its ready line.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::rpc::{DaemonReply, DaemonRequest};
use super::DAEMON_ENV;
use crate::error::{BabblingError, BabblingResult};

/// Default time a child gets to acknowledge readiness.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the command that runs a daemon child.
pub trait DaemonLauncher: Send + Sync {
    fn command(&self) -> BabblingResult<Command>;

    /// Where the child's stderr, and so its log output, goes.
    fn stderr(&self) -> BabblingResult<Stdio> {
        Ok(Stdio::null())
    }
}

/// Opens `path` for appending, creating it if needed.
fn log_sink(path: Option<&Path>) -> BabblingResult<Stdio> {
    let Some(path) = path else {
        return Ok(Stdio::null());
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            BabblingError::Daemon(format!(
                "Failed to open daemon log {}: {}",
                path.display(),
                e
            ))
        })?;
    Ok(Stdio::from(file))
}

/// Re-executes the current binary with the daemon flag set.
#[derive(Debug, Clone, Default)]
pub struct CurrentExeLauncher {
    args: Vec<OsString>,
    log_file: Option<PathBuf>,
}

impl CurrentExeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra arguments for the child invocation.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends the child's stderr to `path`.
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

impl DaemonLauncher for CurrentExeLauncher {
    fn command(&self) -> BabblingResult<Command> {
        let exe = std::env::current_exe()?;
        let mut command = Command::new(exe);
        command.args(&self.args).env(DAEMON_ENV, "1");
        Ok(command)
    }

    fn stderr(&self) -> BabblingResult<Stdio> {
        log_sink(self.log_file.as_deref())
    }
}

/// Runs an arbitrary program as the daemon child.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: OsString,
    args: Vec<OsString>,
    log_file: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends the child's stderr to `path`.
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

impl DaemonLauncher for CommandLauncher {
    fn command(&self) -> BabblingResult<Command> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).env(DAEMON_ENV, "1");
        Ok(command)
    }

    fn stderr(&self) -> BabblingResult<Stdio> {
        log_sink(self.log_file.as_deref())
    }
}

/// A daemon that acknowledged readiness. Holds no handle to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonHandle {
    pub pid: Option<u32>,
}

/// Starts a detached daemon for `request` and waits for its ready line.
///
/// The request is written to the child's stdin as one JSON line and stdin
/// is closed. The child runs in its own process group and is not reaped.
/// Fails if the child exits, answers with an error, or stays silent past
/// `ack_timeout`; in that case the child is killed.
///
/// # Arguments
/// * `launcher` - Builds the child command
/// * `request` - App to rebuild and the call to run in it
/// * `ack_timeout` - How long the child has to answer
pub async fn spawn(
    launcher: &dyn DaemonLauncher,
    request: &DaemonRequest,
    ack_timeout: Duration,
) -> BabblingResult<DaemonHandle> {
    let mut command = launcher.command()?;
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(launcher.stderr()?)
        .kill_on_drop(false);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| BabblingError::Daemon(format!("Failed to start daemon: {}", e)))?;
    log::debug!("[Daemon] Started child {:?} for {}", child.id(), request.app_name);

    match handshake(&mut child, request, ack_timeout).await {
        Ok(()) => {
            let handle = DaemonHandle { pid: child.id() };
            log::info!(
                "[Daemon] {} ready (pid {:?})",
                request.app_name,
                handle.pid
            );
            Ok(handle)
        }
        Err(e) => {
            log::warn!("[Daemon] {} failed to start: {}", request.app_name, e);
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(e)
        }
    }
}

async fn handshake(
    child: &mut Child,
    request: &DaemonRequest,
    ack_timeout: Duration,
) -> BabblingResult<()> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BabblingError::Daemon("daemon stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BabblingError::Daemon("daemon stdout unavailable".to_string()))?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    drop(stdin);

    let mut replies = BufReader::new(stdout).lines();
    let reply = match tokio::time::timeout(ack_timeout, replies.next_line()).await {
        Ok(Ok(Some(reply))) => reply,
        Ok(Ok(None)) => {
            return Err(BabblingError::Daemon(
                "daemon exited before acknowledging".to_string(),
            ))
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(BabblingError::Daemon(format!(
                "no ready acknowledgment within {:?}",
                ack_timeout
            )))
        }
    };

    match serde_json::from_str::<DaemonReply>(&reply) {
        Ok(DaemonReply::Ready) => Ok(()),
        Ok(DaemonReply::Error { message }) => Err(BabblingError::Daemon(message)),
        Err(_) => Err(BabblingError::Daemon(format!(
            "unexpected daemon reply: {}",
            reply
        ))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request() -> DaemonRequest {
        DaemonRequest {
            device_name: Some("Den".into()),
            app_name: "babbler".into(),
            app_options: serde_json::Value::Null,
            rpc: None,
        }
    }

    fn sh(script: &str) -> CommandLauncher {
        CommandLauncher::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn resolves_after_ready_line() {
        let launcher = sh(r#"read line; echo '{"type":"ready"}'"#);
        let handle = spawn(&launcher, &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(handle.pid.is_some());
    }

    #[tokio::test]
    async fn child_receives_request_line() {
        // Echo back an error carrying the app name from the request line.
        let launcher = sh(
            r#"read line; case "$line" in *'"appName":"babbler"'*) echo '{"type":"error","message":"saw babbler"}';; esac"#,
        );
        let err = spawn(&launcher, &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BabblingError::Daemon(ref m) if m == "saw babbler"));
    }

    #[tokio::test]
    async fn child_exiting_early_fails() {
        let launcher = sh("exit 3");
        let err = spawn(&launcher, &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BabblingError::Daemon(_)));
    }

    #[tokio::test]
    async fn silent_child_times_out() {
        let launcher = sh("read line; sleep 30");
        let err = spawn(&launcher, &request(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BabblingError::Daemon(ref m) if m.contains("acknowledgment")));
    }

    #[tokio::test]
    async fn garbage_reply_fails() {
        let launcher = sh("read line; echo hello");
        assert!(spawn(&launcher, &request(), Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn child_stderr_reaches_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("daemon.log");
        let launcher = sh(r#"read line; echo "child log line" >&2; echo '{"type":"ready"}'"#)
            .log_file(&log);

        spawn(&launcher, &request(), Duration::from_secs(5))
            .await
            .unwrap();

        let written = std::fs::read_to_string(&log).unwrap();
        assert!(written.contains("child log line"), "{:?}", written);
    }

    #[test]
    fn unopenable_log_file_is_a_daemon_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher =
            CommandLauncher::new("sh").log_file(dir.path().join("missing").join("x.log"));
        assert!(matches!(launcher.stderr(), Err(BabblingError::Daemon(_))));
    }

    #[test]
    fn current_exe_launcher_sets_daemon_flag() {
        let command = CurrentExeLauncher::new().with_args(["--quiet"]).command().unwrap();
        let flag = command
            .as_std()
            .get_envs()
            .find(|(key, _)| key.to_str() == Some(DAEMON_ENV))
            .and_then(|(_, value)| value);
        assert_eq!(flag, Some(std::ffi::OsStr::new("1")));
    }
}
