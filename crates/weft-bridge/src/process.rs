//! Generation-runtime process supervision.
//!
//! The runtime is spawned as a child process; its stdin/stdout become the
//! transport's byte streams and its stderr is forwarded line-by-line into
//! tracing. When the child exits, the transport's reader observes EOF and
//! the close path rejects everything pending.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::transport::Transport;

/// How to launch the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

/// A supervised runtime child process.
pub struct RuntimeProcess {
    child: Child,
}

impl RuntimeProcess {
    /// Spawn the runtime and wire its stdio into a fresh transport.
    pub fn spawn(
        config: &RuntimeProcessConfig,
        bridge: BridgeConfig,
    ) -> Result<(Transport, RuntimeProcess), BridgeError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BridgeError::Spawn)?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        tokio::spawn(forward_logs(stderr));
        let transport = Transport::spawn(stdin, stdout, bridge);
        info!(command = %config.command, pid = child.id(), "generation runtime spawned");

        Ok((transport, RuntimeProcess { child }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Forcefully terminate the child.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

fn missing_pipe(name: &str) -> BridgeError {
    BridgeError::Spawn(std::io::Error::other(format!(
        "runtime child has no {name} pipe"
    )))
}

/// Forward runtime stderr lines into tracing at a level inferred from the
/// line's own severity tag.
async fn forward_logs<R>(stderr: R)
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let upper = line.to_ascii_uppercase();
        if upper.contains("ERROR") || upper.contains("FATAL") {
            error!(target: "weft::runtime", "{line}");
        } else if upper.contains("WARN") {
            warn!(target: "weft::runtime", "{line}");
        } else {
            info!(target: "weft::runtime", "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tracing_test::traced_test;

    #[traced_test]
    #[tokio::test]
    async fn stderr_lines_surface_through_tracing() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let forwarder = tokio::spawn(forward_logs(reader));

        writer
            .write_all(b"loading model weights\nERROR metal allocation failed\n")
            .await
            .unwrap();
        drop(writer);
        forwarder.await.unwrap();

        assert!(logs_contain("loading model weights"));
        assert!(logs_contain("metal allocation failed"));
    }
}
