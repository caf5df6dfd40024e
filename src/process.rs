//! Named child-process group: launch, pipe, and track.
//!
//! Each added process gets piped stdout/stderr, a copy task per stream
//! that drains the pipe into a durable log file (synced after every
//! write cycle), and a waiter task that records the exit status. A name
//! is reserved and populated inside a single critical section, so a
//! duplicate add can never race past the existence check.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;
use crate::{AppError, Result};

/// File name for a process's captured standard output.
pub const STDOUT_FILENAME: &str = ".stdout";
/// File name for a process's captured standard error.
pub const STDERR_FILENAME: &str = ".stderr";

const COPY_BUF_SIZE: usize = 256;

/// Durable log file locations for one tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    /// Captured standard output.
    pub stdout: PathBuf,
    /// Captured standard error.
    pub stderr: PathBuf,
}

#[derive(Debug)]
struct ProcessEntry {
    logs: LogPaths,
    running: Arc<AtomicBool>,
    waiter: Option<JoinHandle<Result<ExitStatus>>>,
}

/// Supervises a set of concurrently running named child processes.
#[derive(Debug)]
pub struct ProcessGroup {
    supervisor: Supervisor,
    grace: Duration,
    tracker: TaskTracker,
    entries: Mutex<HashMap<String, ProcessEntry>>,
}

impl ProcessGroup {
    /// Create an empty group tied to the given supervision scope.
    #[must_use]
    pub fn new(supervisor: Supervisor, grace: Duration) -> Self {
        Self {
            supervisor,
            grace,
            tracker: TaskTracker::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Launch `program` under `name`, capturing its output into
    /// `.stdout`/`.stderr` files inside `log_dir`.
    ///
    /// The extra `env` entries are layered over the inherited environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if `name` is already tracked,
    /// or `AppError::Io` / `AppError::Process` on spawn or pipe failure.
    pub async fn add(
        &self,
        name: &str,
        program: &str,
        env: &[(String, String)],
        log_dir: &Path,
    ) -> Result<()> {
        // Reservation and population share this lock, so a concurrent add
        // of the same name cannot observe a half-built entry.
        let mut entries = self.entries.lock().await;
        if entries.contains_key(name) {
            return Err(AppError::AlreadyExists(format!(
                "process {name} already added"
            )));
        }

        let logs = LogPaths {
            stdout: log_dir.join(STDOUT_FILENAME),
            stderr: log_dir.join(STDERR_FILENAME),
        };
        let stdout_sink = create_sink(&logs.stdout).await?;
        let stderr_sink = create_sink(&logs.stderr).await?;

        let mut cmd = Command::new(program);
        cmd.envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Io(format!("spawning {program}: {err}")))?;

        let pid = child.id().unwrap_or(0);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process(format!("{name}: stdout pipe missing")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process(format!("{name}: stderr pipe missing")))?;

        self.spawn_copy(name, "stdout", stdout, stdout_sink);
        self.spawn_copy(name, "stderr", stderr, stderr_sink);

        let running = Arc::new(AtomicBool::new(true));
        let waiter = tokio::spawn(supervise_child(
            name.to_owned(),
            child,
            self.supervisor.cancel_token(),
            self.grace,
            Arc::clone(&running),
        ));

        info!(process = name, program, pid, "child process started");
        entries.insert(
            name.to_owned(),
            ProcessEntry {
                logs,
                running,
                waiter: Some(waiter),
            },
        );
        Ok(())
    }

    /// Durable log file paths for a tracked process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `name` was never added.
    pub async fn output_paths(&self, name: &str) -> Result<LogPaths> {
        let entries = self.entries.lock().await;
        entries
            .get(name)
            .map(|entry| entry.logs.clone())
            .ok_or_else(|| AppError::NotFound(format!("no process named {name}")))
    }

    /// Whether any tracked process is still running.
    pub async fn has_running(&self) -> bool {
        let entries = self.entries.lock().await;
        entries
            .values()
            .any(|entry| entry.running.load(Ordering::SeqCst))
    }

    /// Block until every tracked process has exited and every output copy
    /// task has drained, aggregating all failures.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` joining every non-clean exit.
    pub async fn wait(&self) -> Result<()> {
        let handles: Vec<(String, JoinHandle<Result<ExitStatus>>)> = {
            let mut entries = self.entries.lock().await;
            entries
                .iter_mut()
                .filter_map(|(name, entry)| {
                    entry.waiter.take().map(|handle| (name.clone(), handle))
                })
                .collect()
        };

        let mut failures = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(status)) if status.success() => {
                    debug!(process = %name, "exited cleanly");
                }
                Ok(Ok(status)) => failures.push(format!("{name} {}", describe_exit(status))),
                Ok(Err(err)) => failures.push(format!("{name}: {err}")),
                Err(err) => failures.push(format!("{name}: waiter task failed: {err}")),
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::Process(failures.join("; ")))
        }
    }

    fn spawn_copy(
        &self,
        name: &str,
        stream: &'static str,
        reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        sink: tokio::fs::File,
    ) {
        let supervisor = self.supervisor.clone();
        let cancel = self.supervisor.cancel_token();
        let name = name.to_owned();
        self.tracker.spawn(async move {
            if let Err(err) = copy_to_sink(reader, sink, cancel).await {
                supervisor.fail(AppError::Io(format!(
                    "copying {stream} for {name}: {err}"
                )));
            }
        });
    }
}

async fn create_sink(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::create(path)
        .await
        .map_err(|err| AppError::Io(format!("creating {}: {err}", path.display())))
}

/// Drain `reader` into `sink`, syncing the file after every write cycle so
/// captured output survives a crash of the child or the supervisor.
async fn copy_to_sink(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    mut sink: tokio::fs::File,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if read == 0 {
            break;
        }
        sink.write_all(&buf[..read]).await?;
        sink.sync_all().await?;
    }
    Ok(())
}

/// Wait for one child to exit. On cancellation the child is granted a
/// grace period for a natural exit and then force-killed.
async fn supervise_child(
    name: String,
    mut child: Child,
    cancel: CancellationToken,
    grace: Duration,
    running: Arc<AtomicBool>,
) -> Result<ExitStatus> {
    let result = tokio::select! {
        status = child.wait() => {
            status.map_err(|err| AppError::Process(format!("waiting on {name}: {err}")))
        }
        () = cancel.cancelled() => terminate(&name, &mut child, grace).await,
    };
    running.store(false, Ordering::SeqCst);
    result
}

async fn terminate(name: &str, child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    debug!(process = name, ?grace, "shutdown requested, granting grace period");
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.map_err(|err| AppError::Process(format!("waiting on {name}: {err}"))),
        Err(_) => {
            warn!(
                process = name,
                "child did not exit within grace period, forcing kill"
            );
            child
                .kill()
                .await
                .map_err(|err| AppError::Process(format!("killing {name}: {err}")))?;
            child
                .wait()
                .await
                .map_err(|err| AppError::Process(format!("reaping {name}: {err}")))
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    status.code().map_or_else(
        || "terminated by signal".to_owned(),
        |code| format!("exited with code {code}"),
    )
}
