//! Child-process stdio transport.
//!
//! Spawns the server binary directly (never through a shell), frames
//! messages as newline-delimited JSON on stdin/stdout, and logs stderr at
//! debug. Malformed lines are dropped without disturbing the stream.
//! Graceful close sends SIGTERM, waits a 5 second grace period, then
//! SIGKILLs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use mcpr_protocol::JsonRpcMessage;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{TransportError, TransportResult};
use crate::TransportChannels;

/// How long a SIGTERM'd child gets before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running child process speaking newline-delimited JSON-RPC on its pipes.
pub struct StdioTransport {
    pid: u32,
    shutdown: CancellationToken,
    exit: watch::Receiver<Option<i32>>,
}

impl StdioTransport {
    /// Spawn `command` and wire its pipes into a message duplex.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the process cannot be started and
    /// [`TransportError::MissingPipe`] if a pipe could not be acquired.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&PathBuf>,
    ) -> TransportResult<(Self, TransportChannels)> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let pid = child.id().ok_or(TransportError::MissingPipe { stream: "pid" })?;
        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::MissingPipe { stream: "stderr" })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(stdout, inbound_tx));
        tokio::spawn(write_loop(stdin, outbound_rx));
        tokio::spawn(stderr_loop(stderr, command.to_string()));
        tokio::spawn(lifecycle_loop(child, pid, shutdown.clone(), exit_tx));

        debug!(pid, command, "stdio transport spawned");

        let transport = Self {
            pid,
            shutdown,
            exit: exit_rx,
        };
        let channels = TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        };
        Ok((transport, channels))
    }

    /// Pid of the supervised child.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit code of the child once it has terminated.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// A receiver that resolves when the child exits.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    /// Request graceful shutdown and wait for the child to exit.
    ///
    /// Returns the exit code when the child reported one.
    pub async fn close(&self) -> Option<i32> {
        self.shutdown.cancel();
        let mut exit = self.exit.clone();
        // wait_for only fails if the lifecycle task is gone, in which case
        // the child already exited.
        let _ = exit.wait_for(|code| code.is_some()).await;
        *exit.borrow()
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("pid", &self.pid)
            .field("exit", &self.exit_code())
            .finish_non_exhaustive()
    }
}

/// Read newline-delimited JSON from the child's stdout.
///
/// Accumulates bytes until `\n`, parses, and forwards. A malformed line is
/// logged and dropped; in-flight requests on the same stream are unaffected.
async fn read_loop<R>(stdout: R, inbound: mpsc::UnboundedSender<JsonRpcMessage>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match JsonRpcMessage::from_str(trimmed) {
                    Ok(message) => {
                        if inbound.send(message).is_err() {
                            trace!("inbound receiver dropped, stopping read loop");
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, line = %truncate(trimmed, 200), "dropping malformed line");
                    }
                }
            }
            Ok(None) => {
                trace!("child stdout reached eof");
                break;
            }
            Err(error) => {
                warn!(%error, "error reading child stdout");
                break;
            }
        }
    }
}

/// Write one message per line to the child's stdin.
async fn write_loop<W>(stdin: W, mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = BufWriter::new(stdin);
    while let Some(message) = outbound.recv().await {
        let wire = match message.to_wire() {
            Ok(wire) => wire,
            Err(error) => {
                warn!(%error, "failed to serialize outbound message");
                continue;
            }
        };
        if writer.write_all(wire.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
            || writer.flush().await.is_err()
        {
            debug!("child stdin closed, stopping write loop");
            break;
        }
    }
}

/// Drain the child's stderr into debug logs.
async fn stderr_loop<R>(stderr: R, command: String)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(command = %command, "stderr: {line}");
    }
}

/// Own the child: observe its exit, or tear it down on shutdown.
async fn lifecycle_loop(
    mut child: tokio::process::Child,
    pid: u32,
    shutdown: CancellationToken,
    exit: watch::Sender<Option<i32>>,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            debug!(pid, ?code, "child exited");
            let _ = exit.send(Some(code.unwrap_or(-1)));
        }
        () = shutdown.cancelled() => {
            if let Err(error) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, %error, "SIGTERM failed, child may already be gone");
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => {
                    let code = status.ok().and_then(|s| s.code());
                    debug!(pid, ?code, "child exited after SIGTERM");
                    let _ = exit.send(Some(code.unwrap_or(-1)));
                }
                Err(_) => {
                    warn!(pid, "grace period expired, sending SIGKILL");
                    let _ = child.start_kill();
                    let code = child.wait().await.ok().and_then(|s| s.code());
                    let _ = exit.send(Some(code.unwrap_or(-1)));
                }
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpr_protocol::{JsonRpcRequest, RequestId};

    #[tokio::test]
    async fn test_read_loop_parses_lines() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(client, tx));

        server
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n")
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert!(matches!(message, JsonRpcMessage::Response(_)));
    }

    #[tokio::test]
    async fn test_read_loop_survives_malformed_line() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(client, tx));

        server.write_all(b"this is not json\n").await.unwrap();
        server.write_all(b"\n").await.unwrap();
        server
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":2}\n")
            .await
            .unwrap();

        // The malformed line and blank line are skipped; the request arrives.
        let message = rx.recv().await.unwrap();
        let JsonRpcMessage::Request(req) = message else {
            panic!("expected request");
        };
        assert_eq!(req.method, "ping");
    }

    #[tokio::test]
    async fn test_read_loop_handles_split_writes() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(client, tx));

        // One message delivered across two writes: framing must buffer.
        server
            .write_all(b"{\"jsonrpc\":\"2.0\",\"me")
            .await
            .unwrap();
        tokio::task::yield_now().await;
        server
            .write_all(b"thod\":\"ping\",\"id\":3}\n")
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert!(matches!(message, JsonRpcMessage::Request(_)));
    }

    #[tokio::test]
    async fn test_write_loop_appends_newline() {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(client, rx));

        tx.send(JsonRpcRequest::new(RequestId::Number(1), "ping", None).into())
            .unwrap();
        drop(tx);

        let mut buf = String::new();
        let mut reader = BufReader::new(server);
        tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut buf)
            .await
            .unwrap();
        assert!(buf.ends_with('\n'));
        assert!(buf.contains("\"ping\""));
    }

    #[tokio::test]
    async fn test_spawn_and_close_real_process() {
        // `cat` echoes stdin to stdout, which makes it a handy line server.
        let (transport, channels) =
            StdioTransport::spawn("cat", &[], &HashMap::new(), None).unwrap();
        assert!(transport.pid() > 0);
        assert!(transport.exit_code().is_none());

        let mut inbound = channels.inbound;
        channels
            .outbound
            .send(JsonRpcRequest::new(RequestId::Number(7), "ping", None).into())
            .unwrap();

        let echoed = inbound.recv().await.unwrap();
        let JsonRpcMessage::Request(req) = echoed else {
            panic!("expected echoed request");
        };
        assert_eq!(req.id, RequestId::Number(7));

        let code = transport.close().await;
        assert!(code.is_some());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = StdioTransport::spawn(
            "definitely-not-a-real-binary-mcpr",
            &[],
            &HashMap::new(),
            None,
        );
        assert!(matches!(result, Err(TransportError::Spawn { .. })));
    }
}
