//! Admission-controlled sandbox execution with live log streaming.
//!
//! Each accepted execution materializes the session state into a disposable
//! scratch directory, runs the command in a scrubbed child process under a
//! wall-clock deadline, streams its output to the log fan-out, and tears
//! everything down exactly once.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::error::{Error, Result};
use crate::logs::{LogEntry, LogRouter};
use crate::registry::Session;

/// Ephemeral record for one in-flight sandbox. Exists only while the
/// execution is active; removed once cleanup completes.
#[derive(Debug, Clone, Serialize)]
pub struct RunningContainer {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub status: String,
}

/// Terminal summary of one run, published as the JSON body of a final log
/// entry. Never written back onto the session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session_id: String,
    pub exit_code: i32,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

pub struct SandboxRunner {
    limits: RunnerConfig,
    running: Mutex<std::collections::HashMap<String, RunningContainer>>,
    logs: Arc<LogRouter>,
}

impl SandboxRunner {
    pub fn new(limits: RunnerConfig, logs: Arc<LogRouter>) -> Self {
        Self {
            limits,
            running: Mutex::new(std::collections::HashMap::new()),
            logs,
        }
    }

    /// Admit, prepare, and launch one execution. Returns as soon as the
    /// sandbox task is spawned; the outcome is observable only through the
    /// log stream.
    pub async fn execute(
        self: &Arc<Self>,
        session: &Session,
        command: &str,
        environment: &[String],
    ) -> Result<()> {
        let sandbox_id = format!("sbx-{}", uuid::Uuid::new_v4().simple());

        // Admission control: reserve the slot under the lock so the running
        // set can never exceed the ceiling, not even transiently.
        {
            let mut running = self.running.lock().await;
            if running.len() >= self.limits.max_concurrent {
                return Err(Error::AdmissionRejected);
            }
            running.insert(
                session.id.clone(),
                RunningContainer {
                    id: sandbox_id.clone(),
                    session_id: session.id.clone(),
                    started_at: Utc::now(),
                    status: "preparing".to_string(),
                },
            );
        }

        let scratch = {
            let session_id = session.id.clone();
            let state = session.state.clone();
            tokio::task::spawn_blocking(move || prepare_scratch_dir(&session_id, &state))
                .await
                .map_err(|e| Error::Prep(e.to_string()))
                .and_then(|r| r)
        };
        let scratch = match scratch {
            Ok(scratch) => scratch,
            Err(err) => {
                self.running.lock().await.remove(&session.id);
                return Err(err);
            }
        };

        if let Some(entry) = self.running.lock().await.get_mut(&session.id) {
            entry.status = "running".to_string();
        }
        info!(session_id = %session.id, sandbox_id = %sandbox_id, "sandbox admitted");

        let runner = Arc::clone(self);
        let session_id = session.id.clone();
        let command = command.to_string();
        let environment = environment.to_vec();
        tokio::spawn(async move {
            runner.run_sandbox(session_id, scratch, command, environment).await;
        });

        Ok(())
    }

    /// Snapshot of the running set.
    pub async fn running_containers(&self) -> Vec<RunningContainer> {
        self.running.lock().await.values().cloned().collect()
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    async fn run_sandbox(
        &self,
        session_id: String,
        scratch: TempDir,
        command: String,
        environment: Vec<String>,
    ) {
        self.logs.publish(LogEntry::info(&session_id, "sandbox started"));

        if let Err(err) = self
            .run_to_completion(&session_id, scratch.path(), &command, &environment)
            .await
        {
            error!(session_id = %session_id, error = %err, "sandbox execution failed");
            self.logs.publish(LogEntry::error(&session_id, err.to_string()));
        }

        // Grace delay lets trailing log lines reach subscribers before the
        // running-set entry disappears.
        sleep(Duration::from_secs(self.limits.cleanup_grace_secs)).await;
        self.cleanup(&session_id, scratch).await;
    }

    async fn run_to_completion(
        &self,
        session_id: &str,
        workdir: &Path,
        command: &str,
        environment: &[String],
    ) -> Result<()> {
        let start_time = Utc::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", workdir)
            .env("NODE_ENV", "test")
            .env("SHADOW_SESSION_ID", session_id)
            .envs(parse_environment(environment))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Runtime(format!("failed to start sandbox: {}", e)))?;

        let output = Arc::new(Mutex::new(String::new()));
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_line_reader(session_id, stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_line_reader(session_id, stderr, output.clone()));
        }

        let deadline = Duration::from_secs(self.limits.timeout_secs);
        let status = match timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(Error::Runtime(format!("wait failed: {}", e))),
            Err(_) => {
                terminate(&mut child).await;
                return Err(Error::Timeout(self.limits.timeout_secs));
            }
        };

        // Pipes are closed once the child exited, so the readers finish on
        // their own; await them to get the complete combined output.
        for reader in readers {
            let _ = reader.await;
        }

        let end_time = Utc::now();
        let elapsed = end_time - start_time;
        let exit_code = status.code().unwrap_or(-1);
        self.logs.publish(LogEntry::info(
            session_id,
            format!(
                "sandbox finished with exit code {} ({} ms)",
                exit_code,
                elapsed.num_milliseconds()
            ),
        ));

        let result = ExecutionResult {
            session_id: session_id.to_string(),
            exit_code,
            output: output.lock().await.clone(),
            error: (exit_code != 0).then(|| "non-zero exit code".to_string()),
            start_time,
            end_time,
            duration_ms: elapsed.num_milliseconds().max(0) as u64,
        };
        match serde_json::to_string(&result) {
            Ok(body) => self.logs.publish(LogEntry::info(session_id, body)),
            Err(e) => warn!(session_id = %session_id, error = %e, "failed to encode execution result"),
        }

        Ok(())
    }

    fn spawn_line_reader<R>(
        &self,
        session_id: &str,
        stream: R,
        sink: Arc<Mutex<String>>,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let logs = self.logs.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut sink = sink.lock().await;
                    sink.push_str(&line);
                    sink.push('\n');
                }
                logs.publish(LogEntry::info(&session_id, line));
            }
        })
    }

    /// Runs exactly once per accepted execution, on every path.
    async fn cleanup(&self, session_id: &str, scratch: TempDir) {
        let removed = tokio::task::spawn_blocking(move || scratch.close()).await;
        match removed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "failed to remove scratch dir"),
            Err(e) => warn!(session_id = %session_id, error = %e, "scratch removal task failed"),
        }

        self.running.lock().await.remove(session_id);
        self.logs.publish(LogEntry::info(session_id, "sandbox cleaned up"));
        info!(session_id = %session_id, "sandbox cleaned up");
    }
}

/// Graceful termination: SIGTERM with a short window, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if timeout(Duration::from_millis(500), child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Materialize the session state onto a fresh scratch directory: one file
/// per string-valued state entry plus a minimal synthesized project
/// descriptor.
fn prepare_scratch_dir(
    session_id: &str,
    state: &serde_json::Map<String, serde_json::Value>,
) -> Result<TempDir> {
    let scratch = tempfile::Builder::new()
        .prefix(&format!("shadow-session-{}-", session_id))
        .tempdir()
        .map_err(|e| Error::Prep(format!("mkdir scratch: {}", e)))?;

    let descriptor = json!({
        "name": "shadow-session",
        "version": "1.0.0",
        "scripts": { "test": "echo \"No tests specified\"" },
    });
    let descriptor = serde_json::to_vec_pretty(&descriptor)
        .map_err(|e| Error::Prep(format!("encode package.json: {}", e)))?;
    std::fs::write(scratch.path().join("package.json"), descriptor)
        .map_err(|e| Error::Prep(format!("write package.json: {}", e)))?;

    for (path, value) in state {
        // Non-string values carry no file content; skip them.
        if let Some(content) = value.as_str() {
            write_state_file(scratch.path(), path, content)?;
        }
    }

    Ok(scratch)
}

fn write_state_file(root: &Path, path: &str, content: &str) -> Result<()> {
    let relative = path.trim_start_matches('/');
    let relative = PathBuf::from(relative);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir))
    {
        return Err(Error::Prep(format!("path escapes sandbox: {}", path)));
    }

    let full_path = root.join(&relative);
    if let Some(parent) = full_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::Prep(format!("mkdir {}: {}", path, e)))?;
    }
    std::fs::write(&full_path, content).map_err(|e| Error::Prep(format!("write {}: {}", path, e)))
}

fn parse_environment(environment: &[String]) -> Vec<(String, String)> {
    environment
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}
