//! Remote-execution boundary: starting and stopping tunnel processes on targets.
//!
//! The gateway never talks to targets itself. It asks a [`TunnelBackend`] to
//! start a tunnel on a target that forwards to a local port, and later to stop
//! it again given the handle the start call returned.
//!
//! [`CommandBackend`] implements this by running configured argv templates,
//! e.g. a Salt job:
//!
//! ```text
//! salt {target} remote_control.create_ssh_connection {port} --out=json
//! salt {target} remote_control.close_ssh_connection {handle} --out=json
//! ```

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::tokens::token::RemoteHandle;

/// Errors reported by a [`TunnelBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn remote command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("remote command exited with {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("remote command returned no tunnel handle")]
    NoHandle,

    #[error("remote command timed out")]
    Timeout,

    #[error("remote command is not configured")]
    NotConfigured,

    #[error("remote call task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Starts and stops remote tunnels.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Start a tunnel on `target` forwarding to `local_port` on this host.
    async fn open(&self, target: &str, local_port: u16) -> Result<RemoteHandle, BackendError>;

    /// Stop the tunnel identified by `handle` on `target`.
    async fn close(&self, target: &str, handle: &RemoteHandle) -> Result<(), BackendError>;
}

/// [`TunnelBackend`] that shells out to configured commands.
///
/// Placeholders `{target}`, `{port}` and `{handle}` are substituted per
/// argument; nothing goes through a shell.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    open_command: Vec<String>,
    close_command: Vec<String>,
}

impl CommandBackend {
    pub fn new(open_command: Vec<String>, close_command: Vec<String>) -> Self {
        Self {
            open_command,
            close_command,
        }
    }

    async fn run(template: &[String], vars: &[(&str, &str)]) -> Result<String, BackendError> {
        let argv = render(template, vars);
        let (program, args) = argv.split_first().ok_or(BackendError::NotConfigured)?;
        debug!(program = %program, ?args, "Running remote command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(BackendError::Failed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TunnelBackend for CommandBackend {
    async fn open(&self, target: &str, local_port: u16) -> Result<RemoteHandle, BackendError> {
        let port = local_port.to_string();
        let stdout = Self::run(&self.open_command, &[("target", target), ("port", &port)]).await?;
        extract_handle(&stdout).ok_or(BackendError::NoHandle)
    }

    async fn close(&self, target: &str, handle: &RemoteHandle) -> Result<(), BackendError> {
        Self::run(
            &self.close_command,
            &[("target", target), ("handle", &handle.0)],
        )
        .await
        .map(|_| ())
    }
}

/// Substitute `{name}` placeholders in every argument.
fn render(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// Pull the tunnel handle out of command output.
///
/// JSON output is searched for a `pid` field at the top level or one level
/// down (Salt nests results under the minion id). Anything else falls back to
/// the first non-empty line.
fn extract_handle(stdout: &str) -> Option<RemoteHandle> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(stdout) {
        let pid = obj
            .get("pid")
            .or_else(|| obj.values().find_map(|v| v.get("pid")));
        return pid.and_then(handle_from_json);
    }
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| RemoteHandle(l.to_string()))
}

fn handle_from_json(value: &Value) -> Option<RemoteHandle> {
    match value {
        Value::Number(n) => Some(RemoteHandle(n.to_string())),
        Value::String(s) if !s.is_empty() => Some(RemoteHandle(s.clone())),
        _ => None,
    }
}

/// In-process stand-in for a remote target: `open` binds an echo server on
/// the requested port, `close` tears it down.
#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tokio::sync::{Mutex, Notify};
    use tokio::task::JoinHandle;

    use super::{BackendError, RemoteHandle, TunnelBackend};

    #[derive(Default)]
    pub struct FakeBackend {
        pub opens: AtomicUsize,
        /// Close calls started.
        pub closes: AtomicUsize,
        /// Close calls that ran to the end.
        pub closes_done: AtomicUsize,
        /// Handles in the order their close started.
        pub closing: StdMutex<Vec<RemoteHandle>>,
        pub fail: AtomicBool,
        open_delay: Option<Duration>,
        close_delay: Option<Duration>,
        close_gate: Option<Arc<Notify>>,
        next_pid: AtomicU64,
        listeners: Mutex<HashMap<String, JoinHandle<()>>>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn slow(delay: Duration) -> Self {
            Self {
                open_delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn slow_close(delay: Duration) -> Self {
            Self {
                close_delay: Some(delay),
                ..Self::default()
            }
        }

        /// Every `close` waits for a permit on `gate` before finishing.
        pub fn gated_close(gate: Arc<Notify>) -> Self {
            Self {
                close_gate: Some(gate),
                ..Self::default()
            }
        }

        /// Stop the echo server behind `handle` without going through `close`.
        pub async fn kill(&self, handle: &RemoteHandle) {
            let task = self.listeners.lock().await.remove(&handle.0);
            if let Some(task) = task {
                task.abort();
                let _ = task.await;
            }
        }
    }

    #[async_trait]
    impl TunnelBackend for FakeBackend {
        async fn open(&self, _target: &str, local_port: u16) -> Result<RemoteHandle, BackendError> {
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::Failed {
                    status: 1,
                    stderr: "minion did not respond".into(),
                });
            }
            let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
            let task = tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let (mut rd, mut wr) = stream.split();
                        let _ = tokio::io::copy(&mut rd, &mut wr).await;
                    });
                }
            });
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst) + 1000;
            let handle = RemoteHandle(pid.to_string());
            self.listeners.lock().await.insert(handle.0.clone(), task);
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(handle)
        }

        async fn close(&self, _target: &str, handle: &RemoteHandle) -> Result<(), BackendError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closing.lock().unwrap().push(handle.clone());
            if let Some(delay) = self.close_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(gate) = &self.close_gate {
                gate.notified().await;
            }
            self.kill(handle).await;
            self.closes_done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_render_placeholders() {
        let out = render(
            &argv(&["salt", "{target}", "fn", "{port}", "x{port}x"]),
            &[("target", "minion-1"), ("port", "4242")],
        );
        assert_eq!(out, argv(&["salt", "minion-1", "fn", "4242", "x4242x"]));
    }

    #[test]
    fn test_extract_handle_top_level() {
        assert_eq!(
            extract_handle(r#"{"pid": 1234}"#),
            Some(RemoteHandle("1234".into()))
        );
    }

    #[test]
    fn test_extract_handle_nested() {
        assert_eq!(
            extract_handle(r#"{"minion-1": {"pid": "987"}}"#),
            Some(RemoteHandle("987".into()))
        );
    }

    #[test]
    fn test_extract_handle_missing_pid() {
        assert_eq!(extract_handle(r#"{"minion-1": {}}"#), None);
        assert_eq!(extract_handle("{}"), None);
    }

    #[test]
    fn test_extract_handle_plain_text() {
        assert_eq!(
            extract_handle("\n  4321 \n"),
            Some(RemoteHandle("4321".into()))
        );
        assert_eq!(extract_handle("   \n"), None);
    }

    #[tokio::test]
    async fn test_command_backend_open_and_close() {
        let backend = CommandBackend::new(
            argv(&["echo", "{\"pid\": {port}}"]),
            argv(&["true", "{handle}"]),
        );
        let handle = backend.open("host1", 4000).await.unwrap();
        assert_eq!(handle, RemoteHandle("4000".into()));
        backend.close("host1", &handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_backend_failure() {
        let backend = CommandBackend::new(argv(&["false"]), argv(&["false"]));
        assert!(matches!(
            backend.open("host1", 4000).await,
            Err(BackendError::Failed { .. })
        ));
        assert!(backend
            .close("host1", &RemoteHandle("1".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_command_backend_empty_template() {
        let backend = CommandBackend::new(Vec::new(), Vec::new());
        assert!(matches!(
            backend.open("host1", 1).await,
            Err(BackendError::NotConfigured)
        ));
    }
}
