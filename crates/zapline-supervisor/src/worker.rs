use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::{Mutex, mpsc, watch},
};
use zapline_instance::BotId;

/// Bounded ring of log lines. Each line carries a sequence number so a
/// reader can resume from the cursor it was last handed.
#[derive(Debug)]
pub(crate) struct LogRing {
    capacity: usize,
    last_seq: u64,
    entries: VecDeque<(u64, String)>,
}

impl LogRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            last_seq: 0,
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, line: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.last_seq += 1;
        self.entries.push_back((self.last_seq, line));
    }

    /// Up to `limit` lines newer than `cursor`, oldest first. Cursor 0 asks
    /// for the newest `limit` lines instead.
    pub(crate) fn after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let skip = if cursor == 0 {
            self.entries.len().saturating_sub(limit)
        } else {
            self.entries.partition_point(|(seq, _)| *seq <= cursor)
        };
        let picked: Vec<&(u64, String)> = self.entries.range(skip..).take(limit).collect();
        let next = picked.last().map_or(cursor, |(seq, _)| *seq);
        (picked.into_iter().map(|(_, line)| line.clone()).collect(), next)
    }
}

/// Where an instance's output goes: the in-memory ring, and console.log when
/// a writer task is attached.
#[derive(Clone)]
pub(crate) struct LogSink {
    ring: Arc<Mutex<LogRing>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    pub(crate) fn new(max_lines: usize, file_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            ring: Arc::new(Mutex::new(LogRing::new(max_lines))),
            file_tx,
        }
    }

    pub(crate) async fn emit(&self, line: impl Into<String>) {
        let line = line.into();
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line.clone());
        }
        self.ring.lock().await.push(line);
    }

    pub(crate) async fn tail(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.ring.lock().await.after(cursor, limit)
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// console.log that rolls over into `console.log.1` .. `console.log.<keep>`
/// before a write would push it past `max_bytes`. `max_bytes == 0` never
/// rolls.
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    written: u64,
    file: tokio::fs::File,
}

impl RotatingFile {
    async fn open(path: PathBuf, max_bytes: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        let written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            keep: keep.max(1),
            written,
            file,
        })
    }

    fn numbered(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn roll(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        // Missing generations just fail to rename.
        for n in (1..self.keep).rev() {
            let _ = tokio::fs::rename(self.numbered(n), self.numbered(n + 1)).await;
        }
        tokio::fs::rename(&self.path, self.numbered(1)).await?;
        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let line = line.trim_end_matches('\n');
        let len = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.written > 0 && self.written + len > self.max_bytes {
            if let Err(err) = self.roll().await {
                tracing::debug!(%err, path = %self.path.display(), "console log rotation failed");
            }
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written += len;
        Ok(())
    }
}

/// Starts the console.log writer task and returns its input channel. The
/// task ends once every sender is dropped.
pub(crate) fn spawn_console_log(
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut out = match RotatingFile::open(path.clone(), max_bytes, keep).await {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "console log unavailable");
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            if let Err(err) = out.append(&line).await {
                tracing::debug!(%err, "console log write failed");
            }
        }
    });
    tx
}

/// Contents of `run.json`, rewritten on every launch so an operator can see
/// which process and port a bot was last given.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RunInfo {
    pub bot_id: BotId,
    pub generation: u64,
    pub port: u16,
    pub started_at_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub exec: String,
    pub args: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Readers see either the previous run.json or the new one, never a partial
/// write. `dir` must exist.
pub(crate) async fn write_run_json(dir: &Path, info: &RunInfo) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(info).context("encode run.json")?;
    let staged = dir.join(".run.json.partial");
    tokio::fs::write(&staged, &body)
        .await
        .with_context(|| format!("write {}", staged.display()))?;
    tokio::fs::rename(&staged, dir.join("run.json"))
        .await
        .context("move run.json into place")
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Workers must not outlive the supervisor process.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

pub(crate) async fn port_accepting(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(250),
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub runtime: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPath {
    /// The worker had already exited.
    AlreadyExited,
    /// The worker exited after the termination signal.
    Graceful,
    /// The worker ignored termination and was killed.
    Killed,
}

pub(crate) struct WorkerSpec<'a> {
    pub bot_id: BotId,
    pub port: u16,
    pub webhook_url: Option<&'a str>,
    pub command: &'a str,
    pub args: &'a [String],
    pub workdir: &'a Path,
}

impl WorkerSpec<'_> {
    /// Full argument vector: configured args then `(bot_id, port, webhook_url)`.
    pub(crate) fn argv(&self) -> Vec<String> {
        let mut argv = self.args.to_vec();
        argv.push(self.bot_id.to_string());
        argv.push(self.port.to_string());
        argv.push(self.webhook_url.unwrap_or_default().to_string());
        argv
    }
}

/// A spawned worker. The child itself is owned by a wait task; this handle
/// observes its exit and can signal it.
pub(crate) struct WorkerProcess {
    pid: Option<u32>,
    pgid: Option<i32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl WorkerProcess {
    pub(crate) fn spawn(spec: &WorkerSpec<'_>, sink: &LogSink) -> std::io::Result<Self> {
        let mut cmd = Command::new(spec.command);
        cmd.args(spec.argv())
            .current_dir(spec.workdir)
            .env("PORT", spec.port.to_string())
            .env("BOT_ID", spec.bot_id.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(url) = spec.webhook_url {
            cmd.env("WEBHOOK_URL", url);
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so signals reach the worker's whole tree.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn()?;
        let started = tokio::time::Instant::now();
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        if let Some(out) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stdout] {line}")).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(format!("[stderr] {line}")).await;
                }
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        let wait_sink = sink.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                res = child.wait() => Some(res),
                Some(()) = kill_rx.recv() => None,
            };
            let res = match waited {
                Some(res) => res,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let runtime = started.elapsed();
            let code = match &res {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            match res {
                Ok(status) => {
                    wait_sink
                        .emit(format!(
                            "[zapline] worker exited: status={status} runtime_ms={}",
                            runtime.as_millis()
                        ))
                        .await
                }
                Err(err) => {
                    wait_sink
                        .emit(format!("[zapline] worker wait failed: {err}"))
                        .await
                }
            }
            let _ = exit_tx.send(Some(ExitInfo { code, runtime }));
        });

        Ok(Self {
            pid,
            pgid,
            exit_rx,
            kill_tx,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.exit_info().is_none()
    }

    /// Waits up to `timeout` for the worker to exit.
    pub(crate) async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some())).await {
            Ok(Ok(v)) => *v,
            // Wait task gone without reporting; nothing left to wait for.
            Ok(Err(_)) => Some(ExitInfo {
                code: None,
                runtime: Duration::ZERO,
            }),
            Err(_) => None,
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, graceful: bool) -> bool {
        let Some(pgid) = self.pgid else {
            return false;
        };
        let sig = if graceful {
            libc::SIGTERM
        } else {
            libc::SIGKILL
        };
        unsafe {
            libc::kill(-pgid, sig);
        }
        true
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _graceful: bool) -> bool {
        false
    }

    /// SIGTERM to the worker's process group, escalating to SIGKILL once
    /// `timeout` elapses.
    pub(crate) async fn shutdown(&self, timeout: Duration, sink: &LogSink) -> StopPath {
        if !self.is_alive() {
            return StopPath::AlreadyExited;
        }

        if self.signal_group(true) {
            sink.emit("[zapline] stop: sent SIGTERM").await;
            if self.wait_exit(timeout).await.is_some() {
                return StopPath::Graceful;
            }
        }

        self.signal_group(false);
        let _ = self.kill_tx.send(());
        sink.emit(format!(
            "[zapline] stop: sent SIGKILL (timeout_ms={})",
            timeout.as_millis()
        ))
        .await;

        if self.wait_exit(Duration::from_secs(5)).await.is_none() {
            tracing::error!(pid = ?self.pid, "worker still running after SIGKILL");
        }
        StopPath::Killed
    }
}
