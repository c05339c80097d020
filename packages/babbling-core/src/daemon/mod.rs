//! Out-of-process delegation of long-running playback sessions.
//!
//! A short-lived controller hands its session to a detached child so it can
//! exit while the child keeps servicing Babbler requests and tracking
//! playback:
//!
//! 1. The parent [`spawn`]s the child and writes one [`DaemonRequest`] line
//!    on its stdin.
//! 2. The child ([`serve`]) rebuilds the named app from the [`AppRegistry`],
//!    answers `{"type":"ready"}` on stdout, runs the forwarded [`RpcCall`],
//!    then settles into [`CastApp::run_daemon`](crate::apps::CastApp::run_daemon).
//! 3. The parent returns once it reads the ready line and keeps no handle.
//!
//! Failures after the ready line are logged, never fatal to the child.

mod rpc;
mod spawn;

pub use rpc::{DaemonReply, DaemonRequest, RpcCall};
pub use spawn::{
    spawn, CommandLauncher, CurrentExeLauncher, DaemonHandle, DaemonLauncher,
    DEFAULT_ACK_TIMEOUT,
};

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::apps::{AppContext, AppRegistry};
use crate::config::Config;
use crate::device::{CastDevice, DeviceSelector};
use crate::error::{BabblingError, BabblingResult};
use crate::transport::Transport;

/// Environment variable that marks a daemon child invocation.
pub const DAEMON_ENV: &str = "BABBLING_DAEMON";

/// Returns `true` when this process was started as a daemon child.
pub fn is_daemon_invocation() -> bool {
    std::env::var_os(DAEMON_ENV).is_some_and(|value| value == "1")
}

/// Child side of the handshake.
///
/// Reads one request line from `input`, constructs the app, acknowledges on
/// `output`, then runs the forwarded call and the app's daemon loop. Returns
/// when the daemon loop ends.
///
/// # Arguments
/// * `registry` - Apps the child may construct, by name
/// * `transport` - Transport used to reach the device
/// * `config` - Timeouts and per-app options
/// * `input` - Where the request line arrives (stdin in a real child)
/// * `output` - Where the ready line goes (stdout in a real child)
pub async fn serve<R, W>(
    registry: &AppRegistry,
    transport: Arc<dyn Transport>,
    config: &Config,
    input: R,
    mut output: W,
) -> BabblingResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| BabblingError::Daemon("no request on stdin".to_string()))?;
    let request: DaemonRequest = serde_json::from_str(&line)?;
    log::info!(
        "[Daemon] Serving {} on {}",
        request.app_name,
        request.device_name.as_deref().unwrap_or("first available device")
    );

    let device = Arc::new(CastDevice::new(
        transport,
        DeviceSelector::from(request.device_name.as_deref()),
        config.session_timeouts(),
    ));
    let context = AppContext {
        device,
        options: request.app_options.clone(),
        config: config.clone(),
    };

    let constructed = registry
        .get(&request.app_name)
        .ok_or_else(|| BabblingError::Daemon(format!("unknown app {}", request.app_name)))
        .and_then(|descriptor| descriptor.construct(context));
    let app = match constructed {
        Ok(app) => app,
        Err(e) => {
            let reply = DaemonReply::Error {
                message: e.to_string(),
            };
            write_reply(&mut output, &reply).await?;
            return Err(e);
        }
    };

    write_reply(&mut output, &DaemonReply::Ready).await?;
    drop(output);

    if let Some(rpc) = request.rpc {
        let method = rpc.method();
        if let Err(e) = app.invoke(rpc).await {
            log::error!("[Daemon] {} failed: {}", method, e);
        }
    }

    if let Err(e) = app.run_daemon().await {
        log::error!("[Daemon] {} stopped: {}", request.app_name, e);
    }
    log::info!("[Daemon] {} finished", request.app_name);
    Ok(())
}

/// [`serve`] over the process's own stdin and stdout.
pub async fn serve_stdio(
    registry: &AppRegistry,
    transport: Arc<dyn Transport>,
    config: &Config,
) -> BabblingResult<()> {
    serve(
        registry,
        transport,
        config,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
}

async fn write_reply<W>(output: &mut W, reply: &DaemonReply) -> BabblingResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(reply)?;
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}
