//! Stdio transport: newline-delimited JSON-RPC over a child process.

use super::{Transport, TransportEvent, TransportEvents};
use crate::config::TransportKind;
use crate::error::{McpError, McpResult};
use crate::protocol::JsonRpcMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// MCP transport over a subprocess's stdin/stdout.
pub struct StdioTransport {
    server: String,
    command: String,
    args: Vec<String>,
    /// Extra environment, merged over the inherited host environment.
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
}

impl StdioTransport {
    /// Create a transport; the process is spawned by `start`.
    pub fn new(
        server: &str,
        command: &str,
        args: &[String],
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Self {
        Self {
            server: server.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            env,
            cwd,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn spawn_reader(
        &self,
        stdout: tokio::process::ChildStdout,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let server = self.server.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };

                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::parse(line) {
                            Ok(message) => {
                                if tx.send(TransportEvent::Message(message)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // Servers commonly print banners on stdout.
                                trace!(server = %server, error = %e, line = %line, "Dropping non-JSON-RPC line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(TransportEvent::Error(McpError::Io(e)));
                        break;
                    }
                }
            }

            debug!(server = %server, "Stdio reader exited");
            let _ = tx.send(TransportEvent::Closed);
        });
    }

    fn spawn_stderr_forwarder(&self, stderr: tokio::process::ChildStderr) {
        let server = self.server.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, "stderr: {}", line);
            }
        });
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> McpResult<TransportEvents> {
        let mut child_guard = self.child.lock().await;
        if child_guard.is_some() {
            return Err(McpError::transport("stdio transport already started"));
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        debug!(server = %self.server, command = %self.command, args = ?self.args, "Starting MCP server process");

        let mut child = cmd.spawn().map_err(|e| {
            McpError::transport(format!("Failed to start {}: {e}", self.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport("Failed to get stdout"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_reader(stdout, tx);
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_forwarder(stderr);
        }

        *self.stdin.lock().await = Some(stdin);
        *child_guard = Some(child);
        Ok(rx)
    }

    async fn send(&self, message: &JsonRpcMessage) -> McpResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| McpError::transport("stdin is not writable"))?;

        trace!(server = %self.server, message = %line.trim_end(), "Sending stdio message");
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            *stdin_guard = None;
            return Err(McpError::Io(e));
        }
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();
        *self.stdin.lock().await = None;

        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            if let Err(e) = child.kill().await {
                warn!(server = %self.server, error = %e, "Failed to kill MCP server process");
            }
        }

        debug!(server = %self.server, "Closed stdio transport");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(ref mut child) = *guard {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcResponse, RequestId};
    use serde_json::json;
    use std::time::Duration;

    async fn next_message(rx: &mut TransportEvents) -> Option<JsonRpcMessage> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(TransportEvent::Message(m))) => return Some(m),
                Ok(Some(TransportEvent::Error(_))) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let transport = StdioTransport::new("x", "nonexistent_mcp_server_12345", &[], HashMap::new(), None);
        assert!(transport.start().await.is_err());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = StdioTransport::new("x", "cat", &[], HashMap::new(), None);
        let msg = JsonRpcResponse::success(RequestId::Number(1), json!({})).into();
        assert!(transport.send(&msg).await.is_err());
    }

    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let transport = StdioTransport::new("echo", "cat", &[], HashMap::new(), None);
        let mut rx = transport.start().await.unwrap();

        let msg: JsonRpcMessage = JsonRpcResponse::success(RequestId::Number(7), json!({"ok": true})).into();
        transport.send(&msg).await.unwrap();

        match next_message(&mut rx).await {
            Some(JsonRpcMessage::Response(r)) => {
                assert_eq!(r.id, RequestId::Number(7));
                assert_eq!(r.result, Some(json!({"ok": true})));
            }
            other => panic!("unexpected: {other:?}"),
        }

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unparseable_lines_are_dropped() {
        let args = vec![
            "-c".to_string(),
            r#"echo 'starting server...'; echo '{"jsonrpc":"2.0","method":"notifications/progress"}'"#
                .to_string(),
        ];
        let transport = StdioTransport::new("sh", "sh", &args, HashMap::new(), None);
        let mut rx = transport.start().await.unwrap();

        let first = next_message(&mut rx).await.unwrap();
        assert_eq!(first.method(), Some("notifications/progress"));

        // Process exits after printing; the channel reports closure.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if matches!(event, TransportEvent::Closed) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(closed);
    }

    #[tokio::test]
    async fn test_env_is_merged() {
        let mut env = HashMap::new();
        env.insert("TOOLBRIDGE_TEST_VALUE".to_string(), "42".to_string());
        let args = vec![
            "-c".to_string(),
            r#"echo "{\"jsonrpc\":\"2.0\",\"method\":\"env\",\"params\":{\"v\":\"$TOOLBRIDGE_TEST_VALUE\",\"path\":\"$PATH\"}}""#
                .to_string(),
        ];
        let transport = StdioTransport::new("sh", "sh", &args, env, None);
        let mut rx = transport.start().await.unwrap();

        match next_message(&mut rx).await {
            Some(JsonRpcMessage::Notification(n)) => {
                let params = n.params.unwrap();
                assert_eq!(params["v"], "42");
                // Host environment is inherited alongside the extra values.
                assert!(!params["path"].as_str().unwrap().is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
