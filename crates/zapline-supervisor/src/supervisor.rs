use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use zapline_instance::{BotId, InstanceSnapshot, InstanceStatus};

use crate::config::SupervisorConfig;
use crate::control_client::{ControlClient, ControlError};
use crate::port_alloc::{self, PortAllocator, PortProbe};
use crate::reconciler::{Mirror, Observation, Reconciler};
use crate::store::{BotRecord, BotStore};
use crate::worker::{self, ExitInfo, LogSink, RunInfo, StopPath, WorkerProcess, WorkerSpec};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no live instance for bot {0}")]
    NotFound(BotId),
    #[error("bot {0} does not exist")]
    UnknownBot(BotId),
    #[error("bot id {bot_id} has no port under base port {base_port}")]
    InvalidBotId { bot_id: BotId, base_port: u16 },
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error("failed to spawn worker for bot {bot_id}: {reason}")]
    SpawnFailed { bot_id: BotId, reason: String },
    #[error("worker for bot {bot_id} exited during startup (exit code {code:?})")]
    ExitedEarly { bot_id: BotId, code: Option<i32> },
    #[error("working directory for bot {bot_id}: {reason}")]
    WorkingDir { bot_id: BotId, reason: String },
    #[error("bot store: {0}")]
    Store(String),
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Per-bot settings captured when an instance is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotConfig {
    pub webhook_url: Option<String>,
}

impl BotConfig {
    pub fn from_record(record: &BotRecord, default_webhook_base: Option<&str>) -> Self {
        let webhook_url = record
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| {
                default_webhook_base.map(|base| {
                    format!(
                        "{}/api/whatsapp/webhook/{}",
                        base.trim_end_matches('/'),
                        record.id
                    )
                })
            });
        Self { webhook_url }
    }
}

#[derive(Debug)]
struct LiveState {
    status: InstanceStatus,
    qr_code: Option<String>,
}

struct BotInstance {
    bot_id: BotId,
    generation: u64,
    port: u16,
    webhook_url: Option<String>,
    created_at: DateTime<Utc>,
    started: tokio::time::Instant,
    process: WorkerProcess,
    live: Mutex<LiveState>,
    cancel: CancellationToken,
    // Held while the monitor writes into the bot store; stop takes it
    // before returning so no write from this generation can land afterwards.
    reconcile_gate: Mutex<()>,
    sink: LogSink,
}

impl BotInstance {
    async fn snapshot(&self) -> InstanceSnapshot {
        let live = self.live.lock().await;
        InstanceSnapshot {
            bot_id: self.bot_id,
            generation: self.generation,
            port: self.port,
            pid: self.process.pid(),
            status: live.status,
            qr_code: live.qr_code.clone(),
            webhook_url: self.webhook_url.clone(),
            created_at: self.created_at,
        }
    }

    async fn status(&self) -> InstanceStatus {
        self.live.lock().await.status
    }

    async fn advance(&self, next: InstanceStatus) -> InstanceStatus {
        let mut live = self.live.lock().await;
        if live.status.can_transition_to(next) {
            tracing::info!(
                bot_id = %self.bot_id,
                generation = self.generation,
                from = %live.status,
                to = %next,
                "instance status changed"
            );
            live.status = next;
            if next.is_terminal() || next == InstanceStatus::Active {
                live.qr_code = None;
            }
        }
        live.status
    }
}

struct Inner {
    config: SupervisorConfig,
    ports: PortAllocator,
    client: ControlClient,
    reconciler: Reconciler,
    instances: Mutex<HashMap<BotId, Arc<BotInstance>>>,
    // Serializes create/stop per bot so a restart is stop-then-spawn.
    lifecycle: Mutex<HashMap<BotId, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

/// Owns every live worker process, one per bot.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, store: Arc<dyn BotStore>) -> anyhow::Result<Self> {
        let client = ControlClient::new(config.status_timeout, config.send_timeout)?;
        Ok(Self {
            inner: Arc::new(Inner {
                ports: PortAllocator::new(config.base_port),
                config,
                client,
                reconciler: Reconciler::new(store),
                instances: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    async fn lifecycle_lock(&self, bot_id: BotId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lifecycle.lock().await;
            locks.entry(bot_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn lookup(&self, bot_id: BotId) -> Option<Arc<BotInstance>> {
        self.inner.instances.lock().await.get(&bot_id).cloned()
    }

    async fn is_current(&self, inst: &BotInstance) -> bool {
        self.inner
            .instances
            .lock()
            .await
            .get(&inst.bot_id)
            .is_some_and(|cur| cur.generation == inst.generation)
    }

    /// Removes the bot's instance from the live set and cancels its monitor.
    async fn detach(&self, bot_id: BotId) -> Option<Arc<BotInstance>> {
        let inst = self.inner.instances.lock().await.remove(&bot_id)?;
        inst.cancel.cancel();
        Some(inst)
    }

    /// Removes `inst` only if it is still the bot's current generation.
    async fn evict(&self, inst: &BotInstance) -> bool {
        let removed = {
            let mut map = self.inner.instances.lock().await;
            match map.get(&inst.bot_id) {
                Some(cur) if cur.generation == inst.generation => map.remove(&inst.bot_id),
                _ => None,
            }
        };
        if removed.is_some() {
            inst.cancel.cancel();
            tracing::info!(
                bot_id = %inst.bot_id,
                generation = inst.generation,
                exit_code = ?inst.process.exit_info().and_then(|e| e.code),
                "worker exited; instance evicted"
            );
        }
        removed.is_some()
    }

    async fn terminate(&self, inst: &BotInstance) -> StopPath {
        let timeout = self.inner.config.stop_timeout;
        inst.sink
            .emit(format!(
                "[zapline] stop requested (timeout_ms={})",
                timeout.as_millis()
            ))
            .await;
        let path = inst.process.shutdown(timeout, &inst.sink).await;
        inst.advance(InstanceStatus::Stopped).await;

        // Wait out any reconcile write already in flight.
        let _gate = inst.reconcile_gate.lock().await;

        tracing::info!(
            bot_id = %inst.bot_id,
            generation = inst.generation,
            ?path,
            "instance stopped"
        );
        path
    }

    /// Loads the bot record and starts (or restarts) its worker.
    pub async fn start_bot(&self, bot_id: BotId) -> Result<InstanceSnapshot, SupervisorError> {
        let record = self
            .inner
            .reconciler
            .store()
            .load_bot(bot_id)
            .await
            .map_err(|e| SupervisorError::Store(format!("{e:#}")))?
            .ok_or(SupervisorError::UnknownBot(bot_id))?;
        let config = BotConfig::from_record(
            &record,
            self.inner.config.default_webhook_base.as_deref(),
        );
        self.create_instance(bot_id, config).await
    }

    /// Spawns a worker for `bot_id`, replacing any live instance first.
    ///
    /// Fails, leaving no record behind and the bot persisted as inactive,
    /// when the worker cannot be launched or exits within the spawn grace
    /// window.
    pub async fn create_instance(
        &self,
        bot_id: BotId,
        config: BotConfig,
    ) -> Result<InstanceSnapshot, SupervisorError> {
        let ports = self.inner.ports;
        if !ports.admits(bot_id) {
            return Err(SupervisorError::InvalidBotId {
                bot_id,
                base_port: ports.base_port(),
            });
        }

        let _lifecycle = self.lifecycle_lock(bot_id).await;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        if let Some(old) = self.detach(bot_id).await {
            tracing::info!(%bot_id, generation = old.generation, "restart: stopping previous instance");
            self.terminate(&old).await;
            self.mark_inactive(bot_id).await;
        }

        let inst = match self.launch(bot_id, config).await {
            Ok(inst) => Arc::new(inst),
            Err(err) => {
                self.mark_inactive(bot_id).await;
                return Err(err);
            }
        };

        let snapshot = inst.snapshot().await;
        let mut map = self.inner.instances.lock().await;
        // cleanup_all may have started while this worker was in its grace window.
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            drop(map);
            tracing::info!(%bot_id, generation = inst.generation, "shutting down; discarding new instance");
            self.terminate(&inst).await;
            self.mark_inactive(bot_id).await;
            return Err(SupervisorError::ShuttingDown);
        }
        map.insert(bot_id, inst.clone());
        drop(map);
        self.spawn_monitor(inst);

        tracing::info!(
            %bot_id,
            generation = snapshot.generation,
            port = snapshot.port,
            pid = ?snapshot.pid,
            "instance started"
        );
        Ok(snapshot)
    }

    /// Spawns the worker process and waits out its grace window.
    async fn launch(&self, bot_id: BotId, config: BotConfig) -> Result<BotInstance, SupervisorError> {
        let cfg = &self.inner.config;
        let port = self.inner.ports.allocate(bot_id);
        if port_alloc::probe(port) == PortProbe::InUse {
            tracing::warn!(%bot_id, port, "port already in use; worker may fail to bind");
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let workdir = cfg.instance_dir(bot_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| SupervisorError::WorkingDir {
                bot_id,
                reason: format!("create {}: {e}", workdir.display()),
            })?;

        let log_tx = worker::spawn_console_log(
            workdir.join("logs").join("console.log"),
            cfg.log_file_max_bytes,
            cfg.log_file_max_files,
        );
        let sink = LogSink::new(cfg.log_max_lines, Some(log_tx));
        sink.emit(format!(
            "[zapline] start requested: bot_id={bot_id} generation={generation} port={port}"
        ))
        .await;

        let spec = WorkerSpec {
            bot_id,
            port,
            webhook_url: config.webhook_url.as_deref(),
            command: &cfg.worker_command,
            args: &cfg.worker_args,
            workdir: &workdir,
        };
        let process = match WorkerProcess::spawn(&spec, &sink) {
            Ok(p) => p,
            Err(err) => {
                sink.emit(format!("[zapline] spawn failed: {err}")).await;
                tracing::warn!(%bot_id, error = %err, command = %cfg.worker_command, "worker spawn failed");
                return Err(SupervisorError::SpawnFailed {
                    bot_id,
                    reason: format!("{}: {err}", cfg.worker_command),
                });
            }
        };
        let started = tokio::time::Instant::now();
        let created_at = Utc::now();

        let run = RunInfo {
            bot_id,
            generation,
            port,
            started_at_unix_ms: created_at.timestamp_millis().max(0) as u64,
            pid: process.pid(),
            exec: cfg.worker_command.clone(),
            args: spec.argv(),
            cwd: workdir.display().to_string(),
            webhook_url: config.webhook_url.clone(),
        };
        if let Err(err) = worker::write_run_json(&workdir, &run).await {
            tracing::warn!(%bot_id, error = %err, "failed to write run.json");
        }

        if let Some(exit) = self.await_spawn_grace(&process, port).await {
            sink.emit(format!(
                "[zapline] worker exited during startup: code={:?} runtime_ms={}",
                exit.code,
                exit.runtime.as_millis()
            ))
            .await;
            tracing::warn!(%bot_id, code = ?exit.code, "worker exited during startup");
            return Err(SupervisorError::ExitedEarly {
                bot_id,
                code: exit.code,
            });
        }

        Ok(BotInstance {
            bot_id,
            generation,
            port,
            webhook_url: config.webhook_url,
            created_at,
            started,
            process,
            live: Mutex::new(LiveState {
                status: InstanceStatus::Starting,
                qr_code: None,
            }),
            cancel: CancellationToken::new(),
            reconcile_gate: Mutex::new(()),
            sink,
        })
    }

    /// Persists the bot as inactive with no QR. Called with the lifecycle
    /// lock held, once no monitor can write for this bot.
    async fn mark_inactive(&self, bot_id: BotId) {
        let stopped = Observation {
            status: InstanceStatus::Stopped,
            qr_code: None,
        };
        self.inner
            .reconciler
            .sync(bot_id, &stopped, &mut Mirror::default())
            .await;
    }

    /// Returns early once the worker accepts connections on its port; `Some`
    /// if it exited before that or before the grace window elapsed.
    async fn await_spawn_grace(&self, process: &WorkerProcess, port: u16) -> Option<ExitInfo> {
        let deadline = tokio::time::Instant::now() + self.inner.config.spawn_grace;
        loop {
            if let Some(exit) = process.exit_info() {
                return Some(exit);
            }
            if worker::port_accepting(port).await {
                return process.exit_info();
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return process.exit_info();
            }
            let step = (deadline - now).min(Duration::from_millis(100));
            if let Some(exit) = process.wait_exit(step).await {
                return Some(exit);
            }
        }
    }

    /// Terminates the bot's worker (SIGTERM, then SIGKILL after the stop
    /// timeout) and removes it from the live set.
    pub async fn stop_instance(&self, bot_id: BotId) -> Result<StopPath, SupervisorError> {
        let _lifecycle = self.lifecycle_lock(bot_id).await;
        let inst = self
            .detach(bot_id)
            .await
            .ok_or(SupervisorError::NotFound(bot_id))?;
        Ok(self.terminate(&inst).await)
    }

    /// Stops any live instance and deletes the bot's working directory,
    /// including its session data.
    pub async fn purge_instance_data(
        &self,
        bot_id: BotId,
    ) -> Result<Option<StopPath>, SupervisorError> {
        let _lifecycle = self.lifecycle_lock(bot_id).await;
        let stopped = match self.detach(bot_id).await {
            Some(inst) => Some(self.terminate(&inst).await),
            None => None,
        };

        let dir = self.inner.config.instance_dir(bot_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SupervisorError::WorkingDir {
                    bot_id,
                    reason: format!("remove {}: {e}", dir.display()),
                });
            }
        }
        Ok(stopped)
    }

    /// Live status of the bot's instance.
    ///
    /// An exited worker reports `stopped` (eviction is left to the monitor).
    /// When the control API cannot be reached the last cached status is
    /// returned instead of an error.
    pub async fn get_instance_status(&self, bot_id: BotId) -> Option<InstanceStatus> {
        let inst = self.lookup(bot_id).await?;
        Some(self.refresh_status(&inst).await)
    }

    async fn refresh_status(&self, inst: &BotInstance) -> InstanceStatus {
        if !inst.process.is_alive() {
            return inst.advance(InstanceStatus::Stopped).await;
        }

        match self.inner.client.status(inst.port).await {
            Ok(report) => match InstanceStatus::from_worker(&report.status) {
                Some(next) => {
                    inst.advance(next).await;
                }
                None => {
                    tracing::debug!(bot_id = %inst.bot_id, status = %report.status, "unrecognised worker status");
                }
            },
            Err(err) => {
                tracing::debug!(bot_id = %inst.bot_id, error = %err, "status poll failed; using cached status");
            }
        }

        // Liveness wins over whatever the API said.
        if !inst.process.is_alive() {
            return inst.advance(InstanceStatus::Stopped).await;
        }

        if let Some(fallback) = self.inner.config.starting_fallback
            && inst.status().await == InstanceStatus::Starting
            && inst.started.elapsed() >= fallback
        {
            tracing::warn!(
                bot_id = %inst.bot_id,
                elapsed_ms = inst.started.elapsed().as_millis() as u64,
                "no status from worker; assuming active"
            );
            return inst.advance(InstanceStatus::Active).await;
        }

        inst.status().await
    }

    /// Pending QR code of the bot's instance, cached on success.
    pub async fn get_instance_qr(&self, bot_id: BotId) -> Option<String> {
        let inst = self.lookup(bot_id).await?;
        self.refresh_qr(&inst).await
    }

    async fn refresh_qr(&self, inst: &BotInstance) -> Option<String> {
        match self.inner.client.qr(inst.port).await {
            Ok(Some(qr)) => {
                // Paired or failed sessions keep no QR even if the worker lags.
                if inst.advance(InstanceStatus::QrReady).await != InstanceStatus::QrReady {
                    return None;
                }
                inst.live.lock().await.qr_code = Some(qr.clone());
                Some(qr)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(bot_id = %inst.bot_id, error = %err, "qr poll failed");
                None
            }
        }
    }

    /// Single best-effort delivery through the worker; never retried.
    pub async fn send_message(
        &self,
        bot_id: BotId,
        destination: &str,
        text: &str,
    ) -> Result<(), SupervisorError> {
        let inst = self
            .lookup(bot_id)
            .await
            .ok_or(SupervisorError::NotFound(bot_id))?;
        self.inner
            .client
            .send_message(inst.port, destination, text)
            .await
            .map_err(|err| {
                tracing::warn!(%bot_id, error = %err, "send-message failed");
                err.into()
            })
    }

    pub async fn send_media(
        &self,
        bot_id: BotId,
        destination: &str,
        media_url: &str,
        caption: &str,
    ) -> Result<(), SupervisorError> {
        let inst = self
            .lookup(bot_id)
            .await
            .ok_or(SupervisorError::NotFound(bot_id))?;
        self.inner
            .client
            .send_media(inst.port, destination, media_url, caption)
            .await
            .map_err(|err| {
                tracing::warn!(%bot_id, error = %err, "send-media failed");
                err.into()
            })
    }

    /// Stops every live instance and refuses further creates. Used at
    /// shutdown.
    pub async fn cleanup_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        // Creates already past their flag check finish (and back out) first.
        let held: Vec<Arc<Mutex<()>>> =
            self.inner.lifecycle.lock().await.values().cloned().collect();
        for lock in held {
            drop(lock.lock().await);
        }

        loop {
            let ids: Vec<BotId> = self.inner.instances.lock().await.keys().copied().collect();
            if ids.is_empty() {
                break;
            }

            let mut set = tokio::task::JoinSet::new();
            for bot_id in ids {
                let sup = self.clone();
                set.spawn(async move { (bot_id, sup.stop_instance(bot_id).await) });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(_))) | Ok((_, Err(SupervisorError::NotFound(_)))) => {}
                    Ok((bot_id, Err(err))) => {
                        tracing::warn!(%bot_id, error = %err, "cleanup stop failed");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "cleanup task failed");
                    }
                }
            }
        }
        tracing::info!("all instances stopped");
    }

    pub async fn snapshot(&self, bot_id: BotId) -> Option<InstanceSnapshot> {
        let inst = self.lookup(bot_id).await?;
        Some(inst.snapshot().await)
    }

    pub async fn list_instances(&self) -> Vec<InstanceSnapshot> {
        let all: Vec<Arc<BotInstance>> =
            self.inner.instances.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(all.len());
        for inst in all {
            out.push(inst.snapshot().await);
        }
        out.sort_by_key(|s| s.bot_id);
        out
    }

    pub async fn tail_logs(
        &self,
        bot_id: BotId,
        cursor: u64,
        limit: usize,
    ) -> Option<(Vec<String>, u64)> {
        let inst = self.lookup(bot_id).await?;
        Some(inst.sink.tail(cursor, limit).await)
    }

    fn spawn_monitor(&self, inst: Arc<BotInstance>) {
        let sup = self.clone();
        tokio::spawn(async move {
            let mut mirror = Mirror::default();
            let initial = Observation {
                status: InstanceStatus::Starting,
                qr_code: None,
            };
            sup.publish(&inst, &initial, &mut mirror).await;

            let period = sup.inner.config.poll_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = inst.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !sup.is_current(&inst).await {
                    break;
                }

                let status = sup.refresh_status(&inst).await;
                let qr_code = if status.is_terminal() {
                    None
                } else {
                    sup.refresh_qr(&inst).await
                };
                let observed = Observation { status, qr_code };
                if !sup.publish(&inst, &observed, &mut mirror).await {
                    break;
                }
                if status == InstanceStatus::Stopped {
                    sup.evict(&inst).await;
                    break;
                }
            }
            tracing::debug!(bot_id = %inst.bot_id, generation = inst.generation, "monitor loop ended");
        });
    }

    /// Writes `observed` into the bot store unless this generation has been
    /// stopped or replaced. Returns false when the monitor should exit.
    async fn publish(&self, inst: &BotInstance, observed: &Observation, mirror: &mut Mirror) -> bool {
        let _gate = inst.reconcile_gate.lock().await;
        if inst.cancel.is_cancelled() {
            return false;
        }
        self.inner.reconciler.sync(inst.bot_id, observed, mirror).await;
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use axum::{
        Json, Router,
        extract::State,
        routing::{get, post},
    };

    use super::*;
    use crate::store::memory::{MemoryStore, Write};

    const SLEEPER: &str = "exec sleep 30";

    fn test_config(data_root: &Path, base_port: u16, script: &str) -> SupervisorConfig {
        SupervisorConfig {
            base_port,
            worker_command: "/bin/sh".to_string(),
            worker_args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
            data_root: data_root.to_path_buf(),
            default_webhook_base: None,
            poll_interval: Duration::from_millis(100),
            spawn_grace: Duration::from_millis(300),
            stop_timeout: Duration::from_secs(3),
            status_timeout: Duration::from_millis(500),
            send_timeout: Duration::from_secs(2),
            starting_fallback: None,
            ..SupervisorConfig::default()
        }
    }

    fn supervisor(config: SupervisorConfig) -> (Supervisor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let sup = Supervisor::new(config, store.clone()).unwrap();
        (sup, store)
    }

    #[derive(Clone, Default)]
    struct FakeWorker {
        status: Arc<std::sync::Mutex<String>>,
        qr: Arc<std::sync::Mutex<Option<String>>>,
        sent: Arc<std::sync::Mutex<Vec<serde_json::Value>>>,
    }

    impl FakeWorker {
        fn set(&self, status: &str, qr: Option<&str>) {
            *self.status.lock().unwrap() = status.to_string();
            *self.qr.lock().unwrap() = qr.map(str::to_string);
        }
    }

    async fn fake_status(State(f): State<FakeWorker>) -> Json<serde_json::Value> {
        let status = f.status.lock().unwrap().clone();
        let qr = f.qr.lock().unwrap().clone();
        Json(serde_json::json!({
            "status": status,
            "isReady": status == "ready",
            "qrCode": qr,
        }))
    }

    async fn fake_qr(State(f): State<FakeWorker>) -> Json<serde_json::Value> {
        let qr = f.qr.lock().unwrap().clone();
        Json(serde_json::json!({ "status": qr.is_some(), "qrCode": qr }))
    }

    async fn fake_send(
        State(f): State<FakeWorker>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        f.sent.lock().unwrap().push(body);
        Json(serde_json::json!({ "status": true }))
    }

    /// Serves a fake control API and returns the base port that maps
    /// `bot_id` onto it.
    async fn serve_fake(bot_id: BotId, fake: FakeWorker) -> u16 {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let router = Router::new()
            .route("/status", get(fake_status))
            .route("/qr", get(fake_qr))
            .route("/send-message", post(fake_send))
            .route("/send-media", post(fake_send))
            .with_state(fake);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        port - bot_id.0 as u16
    }

    fn pid_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..50 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn stop_unknown_bot_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, SLEEPER));
        assert!(matches!(
            sup.stop_instance(BotId(4)).await,
            Err(SupervisorError::NotFound(BotId(4)))
        ));
        assert!(sup.list_instances().await.is_empty());
    }

    #[tokio::test]
    async fn create_allocates_port_and_reports_starting() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, SLEEPER));
        let cfg = BotConfig {
            webhook_url: Some("http://hooks.local/webhook/7".to_string()),
        };

        let snap = sup.create_instance(BotId(7), cfg).await.unwrap();
        assert_eq!(snap.port, 8007);
        assert_eq!(snap.status, InstanceStatus::Starting);
        assert!(snap.pid.is_some());

        let run = tokio::fs::read_to_string(dir.path().join("instances/7/run.json"))
            .await
            .unwrap();
        let run: serde_json::Value = serde_json::from_str(&run).unwrap();
        assert_eq!(run["port"], 8007);
        assert_eq!(run["webhook_url"], "http://hooks.local/webhook/7");

        // Nothing listens on 8007, so the cached status stands.
        assert_eq!(
            sup.get_instance_status(BotId(7)).await,
            Some(InstanceStatus::Starting)
        );

        assert_eq!(sup.stop_instance(BotId(7)).await.unwrap(), StopPath::Graceful);
        assert!(sup.snapshot(BotId(7)).await.is_none());
    }

    #[tokio::test]
    async fn create_twice_replaces_previous_instance() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, SLEEPER));

        let first = sup.create_instance(BotId(2), BotConfig::default()).await.unwrap();
        let second = sup.create_instance(BotId(2), BotConfig::default()).await.unwrap();

        assert!(second.generation > first.generation);
        assert_ne!(first.pid, second.pid);
        assert!(!pid_alive(first.pid.unwrap()));
        assert!(pid_alive(second.pid.unwrap()));

        let live = sup.list_instances().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].generation, second.generation);

        sup.cleanup_all().await;
    }

    #[tokio::test]
    async fn early_exit_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, "exit 3"));

        match sup.create_instance(BotId(5), BotConfig::default()).await {
            Err(SupervisorError::ExitedEarly { bot_id, code }) => {
                assert_eq!(bot_id, BotId(5));
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(sup.snapshot(BotId(5)).await.is_none());
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 8000, SLEEPER);
        cfg.worker_command = dir.path().join("no-such-worker").display().to_string();
        let (sup, _) = supervisor(cfg);

        assert!(matches!(
            sup.create_instance(BotId(1), BotConfig::default()).await,
            Err(SupervisorError::SpawnFailed { .. })
        ));
        assert!(sup.list_instances().await.is_empty());
    }

    #[tokio::test]
    async fn bot_id_beyond_port_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 65000, SLEEPER));
        assert!(matches!(
            sup.create_instance(BotId(600), BotConfig::default()).await,
            Err(SupervisorError::InvalidBotId { .. })
        ));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_when_term_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 8000, "trap '' TERM; sleep 30");
        cfg.stop_timeout = Duration::from_millis(500);
        let (sup, _) = supervisor(cfg);

        let snap = sup.create_instance(BotId(3), BotConfig::default()).await.unwrap();
        assert_eq!(sup.stop_instance(BotId(3)).await.unwrap(), StopPath::Killed);
        assert!(sup.snapshot(BotId(3)).await.is_none());
        assert!(!pid_alive(snap.pid.unwrap()));
    }

    #[tokio::test]
    async fn worker_exit_is_evicted_and_persisted_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, store) = supervisor(test_config(dir.path(), 8000, "sleep 1"));
        store.insert(BotId(8), None).await;
        store.write_qr_code(BotId(8), Some("stale-qr")).await.unwrap();

        sup.create_instance(BotId(8), BotConfig::default()).await.unwrap();

        let s = &sup;
        assert!(eventually(|| async move { s.snapshot(BotId(8)).await.is_none() }).await);
        let bot = store.get(BotId(8)).await.unwrap();
        assert_eq!(bot.status, "inactive");
        assert_eq!(bot.qr_code, None);
    }

    #[tokio::test]
    async fn status_query_reports_exit_without_evicting() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 8000, "sleep 0.5");
        cfg.poll_interval = Duration::from_secs(60);
        let (sup, _) = supervisor(cfg);

        sup.create_instance(BotId(6), BotConfig::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(
            sup.get_instance_status(BotId(6)).await,
            Some(InstanceStatus::Stopped)
        );
        assert!(sup.snapshot(BotId(6)).await.is_some());
        sup.cleanup_all().await;
    }

    #[tokio::test]
    async fn starting_falls_back_to_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 8000, SLEEPER);
        cfg.poll_interval = Duration::from_secs(60);
        cfg.starting_fallback = Some(Duration::from_millis(200));
        let (sup, _) = supervisor(cfg);

        sup.create_instance(BotId(9), BotConfig::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            sup.get_instance_status(BotId(9)).await,
            Some(InstanceStatus::Active)
        );
        sup.cleanup_all().await;
    }

    #[tokio::test]
    async fn control_api_drives_status_qr_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeWorker::default();
        fake.set("qr_ready", Some("data:image/png;base64,QR"));
        let base = serve_fake(BotId(1), fake.clone()).await;
        let (sup, store) = supervisor(test_config(dir.path(), base, SLEEPER));
        store.insert(BotId(1), None).await;

        sup.create_instance(BotId(1), BotConfig::default()).await.unwrap();
        assert_eq!(
            sup.get_instance_status(BotId(1)).await,
            Some(InstanceStatus::QrReady)
        );
        assert_eq!(
            sup.get_instance_qr(BotId(1)).await.as_deref(),
            Some("data:image/png;base64,QR")
        );
        let st = &store;
        assert!(
            eventually(|| async move {
                st.get(BotId(1)).await.unwrap().qr_code.as_deref()
                    == Some("data:image/png;base64,QR")
            })
            .await
        );

        fake.set("ready", None);
        assert_eq!(
            sup.get_instance_status(BotId(1)).await,
            Some(InstanceStatus::Active)
        );
        assert!(
            eventually(|| async move {
                let bot = st.get(BotId(1)).await.unwrap();
                bot.status == "active" && bot.qr_code.is_none()
            })
            .await
        );
        assert_eq!(sup.snapshot(BotId(1)).await.unwrap().qr_code, None);

        sup.stop_instance(BotId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn send_without_instance_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, SLEEPER));
        assert!(matches!(
            sup.send_message(BotId(7), "5511999999999", "hi").await,
            Err(SupervisorError::NotFound(BotId(7)))
        ));
        assert!(matches!(
            sup.send_media(BotId(7), "5511999999999", "http://x/a.png", "").await,
            Err(SupervisorError::NotFound(BotId(7)))
        ));
    }

    #[tokio::test]
    async fn send_forwards_to_worker() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeWorker::default();
        fake.set("ready", None);
        let base = serve_fake(BotId(2), fake.clone()).await;
        let (sup, _) = supervisor(test_config(dir.path(), base, SLEEPER));

        sup.create_instance(BotId(2), BotConfig::default()).await.unwrap();
        sup.send_message(BotId(2), "5511999999999", "hello").await.unwrap();
        sup.send_media(BotId(2), "5511999999999", "http://x/a.png", "look")
            .await
            .unwrap();

        let sent = fake.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["message"], "hello");
        assert_eq!(sent[1]["mediaUrl"], "http://x/a.png");

        sup.cleanup_all().await;
    }

    #[tokio::test]
    async fn cleanup_all_stops_everything_and_refuses_creates() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, SLEEPER));
        let a = sup.create_instance(BotId(1), BotConfig::default()).await.unwrap();
        let b = sup.create_instance(BotId(2), BotConfig::default()).await.unwrap();

        sup.cleanup_all().await;

        assert!(sup.list_instances().await.is_empty());
        assert!(!pid_alive(a.pid.unwrap()));
        assert!(!pid_alive(b.pid.unwrap()));
        assert!(matches!(
            sup.create_instance(BotId(1), BotConfig::default()).await,
            Err(SupervisorError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn cleanup_during_spawn_grace_discards_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 8000, SLEEPER);
        cfg.spawn_grace = Duration::from_millis(600);
        let (sup, store) = supervisor(cfg);
        store.insert(BotId(11), None).await;

        let creating = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.create_instance(BotId(11), BotConfig::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        sup.cleanup_all().await;

        assert!(sup.list_instances().await.is_empty());
        let run = tokio::fs::read_to_string(dir.path().join("instances/11/run.json"))
            .await
            .unwrap();
        let run: serde_json::Value = serde_json::from_str(&run).unwrap();
        assert!(!pid_alive(run["pid"].as_u64().unwrap() as u32));

        assert!(matches!(
            creating.await.unwrap(),
            Err(SupervisorError::ShuttingDown)
        ));
        assert!(sup.list_instances().await.is_empty());
        assert_eq!(store.get(BotId(11)).await.unwrap().status, "inactive");
    }

    /// Exits with `relaunch` on every launch after the first; the first
    /// launch runs `first`.
    fn relaunch_script(dir: &Path, first: &str, relaunch: &str) -> String {
        let marker = dir.join("launched");
        format!(
            "if [ -e '{m}' ]; then {relaunch}; fi; touch '{m}'; {first}",
            m = marker.display()
        )
    }

    #[tokio::test]
    async fn failed_restart_persists_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let script = relaunch_script(dir.path(), SLEEPER, "exit 3");
        let (sup, store) = supervisor(test_config(dir.path(), 8000, &script));
        store.insert(BotId(12), None).await;

        let first = sup.create_instance(BotId(12), BotConfig::default()).await.unwrap();
        let st = &store;
        assert!(
            eventually(|| async move { st.get(BotId(12)).await.unwrap().status == "starting" })
                .await
        );
        store.write_qr_code(BotId(12), Some("old-qr")).await.unwrap();

        assert!(matches!(
            sup.create_instance(BotId(12), BotConfig::default()).await,
            Err(SupervisorError::ExitedEarly { code: Some(3), .. })
        ));
        assert!(sup.snapshot(BotId(12)).await.is_none());
        assert!(!pid_alive(first.pid.unwrap()));

        let bot = store.get(BotId(12)).await.unwrap();
        assert_eq!(bot.status, "inactive");
        assert_eq!(bot.qr_code, None);
    }

    #[tokio::test]
    async fn replaced_generation_cannot_evict_or_write() {
        let dir = tempfile::tempdir().unwrap();
        let script = relaunch_script(dir.path(), "sleep 0.6", SLEEPER);
        let (sup, store) = supervisor(test_config(dir.path(), 8000, &script));
        store.insert(BotId(13), None).await;

        sup.create_instance(BotId(13), BotConfig::default()).await.unwrap();
        let stale = sup.lookup(BotId(13)).await.unwrap();
        let second = sup.create_instance(BotId(13), BotConfig::default()).await.unwrap();

        // Past the first worker's natural exit and several poll ticks.
        tokio::time::sleep(Duration::from_millis(900)).await;
        let live = sup.snapshot(BotId(13)).await.unwrap();
        assert_eq!(live.generation, second.generation);
        assert!(pid_alive(second.pid.unwrap()));

        assert!(!sup.is_current(&stale).await);
        assert!(!sup.evict(&stale).await);
        let gone = Observation {
            status: InstanceStatus::Stopped,
            qr_code: None,
        };
        assert!(!sup.publish(&stale, &gone, &mut Mirror::default()).await);
        assert!(sup.snapshot(BotId(13)).await.is_some());

        let writes = store.writes().await;
        let starting = Write::Status(BotId(13), "starting".into());
        let inactive = Write::Status(BotId(13), "inactive".into());
        let last_start = writes.iter().rposition(|w| *w == starting).unwrap();
        assert!(writes[..last_start].contains(&inactive));
        assert!(!writes[last_start..].contains(&inactive));
        assert_eq!(store.get(BotId(13)).await.unwrap().status, "starting");

        sup.cleanup_all().await;
    }

    #[tokio::test]
    async fn start_bot_uses_default_webhook() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), 8000, SLEEPER);
        cfg.default_webhook_base = Some("http://control.local".to_string());
        let (sup, store) = supervisor(cfg);

        assert!(matches!(
            sup.start_bot(BotId(4)).await,
            Err(SupervisorError::UnknownBot(BotId(4)))
        ));

        store.insert(BotId(4), None).await;
        let snap = sup.start_bot(BotId(4)).await.unwrap();
        assert_eq!(
            snap.webhook_url.as_deref(),
            Some("http://control.local/api/whatsapp/webhook/4")
        );
        sup.cleanup_all().await;
    }

    #[tokio::test]
    async fn purge_stops_and_removes_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, SLEEPER));
        sup.create_instance(BotId(3), BotConfig::default()).await.unwrap();
        assert!(dir.path().join("instances/3").exists());

        let stopped = sup.purge_instance_data(BotId(3)).await.unwrap();
        assert_eq!(stopped, Some(StopPath::Graceful));
        assert!(!dir.path().join("instances/3").exists());
        assert_eq!(sup.purge_instance_data(BotId(3)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tail_logs_includes_lifecycle_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, _) = supervisor(test_config(dir.path(), 8000, "echo hello-from-worker; exec sleep 30"));
        sup.create_instance(BotId(1), BotConfig::default()).await.unwrap();

        let s = &sup;
        assert!(
            eventually(|| async move {
                let (lines, _) = s.tail_logs(BotId(1), 0, 50).await.unwrap();
                lines.iter().any(|l| l.contains("hello-from-worker"))
            })
            .await
        );
        let (lines, _) = sup.tail_logs(BotId(1), 0, 50).await.unwrap();
        assert!(lines[0].contains("start requested"));
        sup.cleanup_all().await;
    }
}
