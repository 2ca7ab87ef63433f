//! Agent CLI adapter seam.
//!
//! `Adapter` is the interface a node manager uses to launch and observe
//! whatever actually executes a run. What a concrete adapter does with a
//! run's prompt -- which sandbox, which LLM CLI -- is out of scope here;
//! [`ProcessAdapter`] is a minimal implementation that runs a plain
//! subprocess, enough to exercise the full handshake end to end.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use anyhow::{Context, Result};
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use fleet_db::models::TaskSnapshot;

/// Handle to a spawned run, opaque to callers beyond what they need to
/// track and tear it down.
#[derive(Debug, Clone)]
pub struct AdapterHandle {
    pub run_id: uuid::Uuid,
    pub pid: u32,
}

/// One line of output from a running adapter.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A line of text the run emitted.
    Message(String),
    /// The run's process exited.
    Completed { success: bool, error: Option<String> },
}

/// Adapter interface for launching and observing a run.
///
/// Object-safe so node managers can hold `Arc<dyn Adapter>` without
/// committing to one concrete implementation at compile time.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Human-readable name for this adapter, used in logs.
    fn name(&self) -> &str;

    /// Launch the run described by `snapshot`.
    async fn spawn(&self, run_id: uuid::Uuid, snapshot: &TaskSnapshot) -> Result<AdapterHandle>;

    /// Stream of events for a previously-spawned run. Yields
    /// `AdapterEvent::Completed` exactly once, as the last item.
    fn events(&self, handle: &AdapterHandle) -> Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

    /// Forcibly terminate a run, e.g. because it was cancelled centrally.
    async fn kill(&self, handle: &AdapterHandle) -> Result<()>;

    /// Whether the run's process is still alive.
    async fn is_running(&self, handle: &AdapterHandle) -> bool;
}

struct ProcessState {
    child: Child,
}

/// Adapter that runs a run's prompt as a plain subprocess line, streaming
/// its stdout back as [`AdapterEvent::Message`] values.
///
/// Not a sandbox and not an agent CLI integration -- both are explicitly
/// out of scope. This exists so the node manager's poll/execute/report
/// handshake can be exercised without either.
#[derive(Clone)]
pub struct ProcessAdapter {
    shell: String,
    processes: Arc<Mutex<HashMap<uuid::Uuid, ProcessState>>>,
}

impl ProcessAdapter {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for ProcessAdapter {
    fn name(&self) -> &str {
        "process"
    }

    async fn spawn(&self, run_id: uuid::Uuid, snapshot: &TaskSnapshot) -> Result<AdapterHandle> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&snapshot.prompt);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn process for run {run_id}"))?;
        let pid = child.id().context("spawned child has no pid")?;

        self.processes
            .lock()
            .await
            .insert(run_id, ProcessState { child });

        Ok(AdapterHandle { run_id, pid })
    }

    fn events(&self, handle: &AdapterHandle) -> Pin<Box<dyn Stream<Item = AdapterEvent> + Send>> {
        let run_id = handle.run_id;
        let processes = Arc::clone(&self.processes);

        let stream = async_stream::stream! {
            let taken = {
                let mut procs = processes.lock().await;
                procs.remove(&run_id)
            };

            let Some(mut state) = taken else {
                yield AdapterEvent::Completed {
                    success: false,
                    error: Some("process not found (already consumed?)".to_string()),
                };
                return;
            };

            let stdout = state.child.stdout.take();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => yield AdapterEvent::Message(line),
                        Ok(None) => break,
                        Err(e) => {
                            yield AdapterEvent::Message(format!("stdout read error: {e}"));
                            break;
                        }
                    }
                }
            }

            match state.child.wait().await {
                Ok(status) if status.success() => {
                    yield AdapterEvent::Completed { success: true, error: None };
                }
                Ok(status) => {
                    yield AdapterEvent::Completed {
                        success: false,
                        error: Some(format!("process exited with {status}")),
                    };
                }
                Err(e) => {
                    yield AdapterEvent::Completed {
                        success: false,
                        error: Some(format!("failed to wait on process: {e}")),
                    };
                }
            }
        };

        Box::pin(stream)
    }

    async fn kill(&self, handle: &AdapterHandle) -> Result<()> {
        let mut processes = self.processes.lock().await;
        if let Some(state) = processes.get_mut(&handle.run_id) {
            state.child.start_kill().context("failed to kill process")?;
        }
        Ok(())
    }

    async fn is_running(&self, handle: &AdapterHandle) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(&handle.run_id) {
            Some(state) => matches!(state.child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn snapshot(prompt: &str) -> TaskSnapshot {
        TaskSnapshot {
            task_id: uuid::Uuid::new_v4(),
            name: "test".to_string(),
            prompt: prompt.to_string(),
            labels: fleet_db::models::Labels::new(),
            requested_node_id: None,
        }
    }

    #[tokio::test]
    async fn process_adapter_streams_stdout_then_completes() {
        let adapter = ProcessAdapter::new();
        let run_id = uuid::Uuid::new_v4();
        let handle = adapter
            .spawn(run_id, &snapshot("echo hello"))
            .await
            .unwrap();

        let events: Vec<AdapterEvent> = adapter.events(&handle).collect().await;
        assert!(matches!(&events[0], AdapterEvent::Message(line) if line == "hello"));
        assert!(matches!(events.last(), Some(AdapterEvent::Completed { success: true, .. })));
    }

    #[tokio::test]
    async fn process_adapter_reports_failure_exit_code() {
        let adapter = ProcessAdapter::new();
        let run_id = uuid::Uuid::new_v4();
        let handle = adapter
            .spawn(run_id, &snapshot("exit 1"))
            .await
            .unwrap();

        let events: Vec<AdapterEvent> = adapter.events(&handle).collect().await;
        assert!(matches!(
            events.last(),
            Some(AdapterEvent::Completed { success: false, .. })
        ));
    }

    #[tokio::test]
    async fn is_running_false_for_unknown_handle() {
        let adapter = ProcessAdapter::new();
        let handle = AdapterHandle {
            run_id: uuid::Uuid::new_v4(),
            pid: 0,
        };
        assert!(!adapter.is_running(&handle).await);
    }
}
