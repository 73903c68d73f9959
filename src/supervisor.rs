//! Supervisor and message router.
//!
//! Owns the shared inbound queue and one [`WorkerHandle`] per agent. Every line popped
//! from the queue is decoded and either handled locally (messages addressed to the
//! supervisor) or forwarded to the addressed worker's pipe. Dead workers are never
//! written to; their messages are dropped with a warning.

use crate::agents::{AgentId, MessageKind};
use crate::config::{FswConfig, LaunchMode, CONFIG_ENV};
use crate::error::{RouteError, SpawnError, WorkerError};
use crate::lifecycle::{Lifecycle, TerminationCause};
use crate::message::{pack, unpack, Message};
use crate::registry::{AgentEntry, Registry};
use crate::worker::{WorkerContext, PIPE_CAPACITY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Heartbeats older than this many periods mark an agent as stale.
const STALE_HEARTBEAT_PERIODS: u32 = 3;
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// The running body of one worker.
#[derive(Debug)]
pub enum WorkerProcess {
    Child(Child),
    Task {
        handle: JoinHandle<Result<(), WorkerError>>,
        cancel: CancellationToken,
    },
}

impl WorkerProcess {
    pub fn is_alive(&mut self) -> bool {
        match self {
            WorkerProcess::Child(child) => matches!(child.try_wait(), Ok(None)),
            WorkerProcess::Task { handle, .. } => !handle.is_finished(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            WorkerProcess::Child(child) => child.id(),
            WorkerProcess::Task { .. } => None,
        }
    }

    /// SIGTERM for a process, the run-flag for a task.
    fn signal_terminate(&mut self) {
        match self {
            WorkerProcess::Child(child) => {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
                        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                        if rc != 0 {
                            debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM not delivered");
                        }
                    }
                }
                #[cfg(not(unix))]
                let _ = child.start_kill();
            }
            WorkerProcess::Task { cancel, .. } => cancel.cancel(),
        }
    }

    fn force_kill(&mut self) {
        match self {
            WorkerProcess::Child(child) => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "kill failed, process already gone");
                }
            }
            WorkerProcess::Task { handle, .. } => handle.abort(),
        }
    }

    /// Collect the exit status. Call only once the worker has exited or been killed.
    async fn reap(&mut self, agent: AgentId) {
        match self {
            WorkerProcess::Child(child) => match child.wait().await {
                Ok(status) if status.success() => debug!(agent = %agent, "worker reaped"),
                Ok(status) => info!(agent = %agent, %status, "worker exited"),
                Err(e) => warn!(agent = %agent, error = %e, "failed to reap worker"),
            },
            WorkerProcess::Task { handle, .. } => match handle.await {
                Ok(Ok(())) => debug!(agent = %agent, "worker reaped"),
                Ok(Err(e)) => warn!(agent = %agent, error = %e, "worker ended with error"),
                Err(e) if e.is_cancelled() => info!(agent = %agent, "worker task aborted"),
                Err(e) => error!(agent = %agent, error = %e, "worker task panicked"),
            },
        }
    }
}

/// Supervisor-side reference to one worker: its process and its receive-pipe.
#[derive(Debug)]
pub struct WorkerHandle {
    pub agent: AgentId,
    entry: AgentEntry,
    pipe: mpsc::Sender<String>,
    process: WorkerProcess,
    reported_dead: bool,
    started_at: Instant,
}

impl WorkerHandle {
    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Write one message to the worker's pipe. Liveness is checked before every write.
    pub fn deliver(&mut self, msg: &Message) -> Result<(), RouteError> {
        if !self.process.is_alive() {
            return Err(RouteError::WorkerDead(self.agent));
        }
        if !self.entry.accepts(msg.kind) {
            return Err(RouteError::UnsupportedKind {
                agent: self.agent,
                kind: msg.kind,
            });
        }
        self.pipe.try_send(pack(msg)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RouteError::PipeFull(self.agent),
            mpsc::error::TrySendError::Closed(_) => RouteError::BrokenPipe(self.agent),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    pub delivered: u64,
    pub handled_locally: u64,
    pub invalid: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Local,
    Invalid,
    Dropped(RouteError),
}

/// How each worker left during shutdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Exited on their own after the broadcast `Terminate`.
    pub graceful: Vec<AgentId>,
    /// Needed the stronger terminate signal.
    pub signalled: Vec<AgentId>,
    pub killed: Vec<AgentId>,
    /// Already dead before shutdown began.
    pub already_dead: Vec<AgentId>,
    pub elapsed_ms: u64,
}

pub struct Supervisor {
    config: Arc<FswConfig>,
    registry: Registry,
    lifecycle: Lifecycle,
    workers: BTreeMap<AgentId, WorkerHandle>,
    inbound_tx: mpsc::Sender<String>,
    inbound_rx: mpsc::Receiver<String>,
    heartbeats: BTreeMap<AgentId, Instant>,
    stale: BTreeSet<AgentId>,
    stats: RouterStats,
    spawn_failures: Vec<(AgentId, String)>,
}

impl Supervisor {
    pub fn new(config: FswConfig, lifecycle: Lifecycle) -> Self {
        Self::with_registry(config, lifecycle, Registry::standard())
    }

    pub fn with_registry(config: FswConfig, lifecycle: Lifecycle, registry: Registry) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(PIPE_CAPACITY);
        Self {
            config: Arc::new(config),
            registry,
            lifecycle,
            workers: BTreeMap::new(),
            inbound_tx,
            inbound_rx,
            heartbeats: BTreeMap::new(),
            stale: BTreeSet::new(),
            stats: RouterStats::default(),
            spawn_failures: Vec::new(),
        }
    }

    /// Handle for injecting raw lines into the shared inbound queue.
    pub fn inbound_sender(&self) -> mpsc::Sender<String> {
        self.inbound_tx.clone()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn spawn_failures(&self) -> &[(AgentId, String)] {
        &self.spawn_failures
    }

    pub fn worker_mut(&mut self, agent: AgentId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&agent)
    }

    pub fn last_heartbeat(&self, agent: AgentId) -> Option<Instant> {
        self.heartbeats.get(&agent).copied()
    }

    pub fn live_workers(&mut self) -> Vec<AgentId> {
        self.workers
            .iter_mut()
            .filter_map(|(agent, handle)| handle.is_alive().then_some(*agent))
            .collect()
    }

    /// Spawn every configured worker with a fixed delay between spawns. A failed
    /// spawn is recorded and the remaining agents are still started. If none of them
    /// came up the lifecycle is triggered with [`TerminationCause::Fatal`].
    pub async fn start(&mut self) {
        let agents = self.config.agents.clone();
        info!(count = agents.len(), mode = ?self.config.launch_mode, "starting workers");
        for (i, agent) in agents.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.spawn_delay()).await;
            }
            if let Err(e) = self.spawn_worker(agent) {
                error!(agent = %agent, error = %e, "worker failed to start");
                self.spawn_failures.push((agent, e.to_string()));
            }
        }
        let running = self.live_workers().len();
        info!(running, failed = self.spawn_failures.len(), "startup complete");
        if running == 0 && !self.spawn_failures.is_empty() {
            error!("no worker could be started");
            self.lifecycle.trigger(TerminationCause::Fatal);
        }
    }

    fn spawn_worker(&mut self, agent: AgentId) -> Result<(), SpawnError> {
        let entry = *self
            .registry
            .lookup(agent)
            .ok_or(SpawnError::NotRegistered(agent))?;
        let (pipe, pipe_rx) = mpsc::channel(PIPE_CAPACITY);

        let process = match self.config.launch_mode {
            LaunchMode::InProcess => {
                let cancel = CancellationToken::new();
                let ctx = WorkerContext::new(
                    agent,
                    Arc::clone(&self.config),
                    pipe_rx,
                    self.inbound_tx.clone(),
                    cancel.clone(),
                );
                WorkerProcess::Task {
                    handle: tokio::spawn((entry.entry)(ctx)),
                    cancel,
                }
            }
            LaunchMode::Process => self.spawn_child(agent, pipe_rx)?,
        };

        let mut handle = WorkerHandle {
            agent,
            entry,
            pipe,
            process,
            reported_dead: false,
            started_at: Instant::now(),
        };
        let alive = handle.is_alive();
        handle.reported_dead = !alive;
        info!(agent = %agent, pid = ?handle.pid(), "worker spawned");
        self.workers.insert(agent, handle);
        if alive {
            Ok(())
        } else {
            Err(SpawnError::DiedAtStartup(agent))
        }
    }

    fn spawn_child(
        &self,
        agent: AgentId,
        mut pipe_rx: mpsc::Receiver<String>,
    ) -> Result<WorkerProcess, SpawnError> {
        let program = match &self.config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|source| SpawnError::Launch { agent, source })?,
        };
        let config_json = serde_json::to_string(&*self.config)
            .map_err(|source| SpawnError::Config { agent, source })?;

        let mut child = Command::new(program)
            .arg("worker")
            .arg("--agent")
            .arg(agent.name())
            .env(CONFIG_ENV, config_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Launch { agent, source })?;

        let missing = |what: &str| SpawnError::Launch {
            agent,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("no {what} handle")),
        };
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        // Receive-pipe writer; a failed write closes the channel so the router sees a broken pipe
        tokio::spawn(async move {
            while let Some(line) = pipe_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(agent = %agent, error = %e, "pipe to worker broken");
                    break;
                }
            }
        });

        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if inbound.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(agent = %agent, error = %e, "reading worker output failed");
                        break;
                    }
                }
            }
            debug!(agent = %agent, "worker output closed");
        });

        Ok(WorkerProcess::Child(child))
    }

    /// Decode one inbound line and forward or handle it. Never panics.
    pub fn route(&mut self, line: &str) -> RouteOutcome {
        let msg = match unpack(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, line = line.trim_end(), "invalid message dropped");
                self.stats.invalid += 1;
                return RouteOutcome::Invalid;
            }
        };

        if msg.receiver == AgentId::Supervisor {
            self.handle_local(&msg);
            self.stats.handled_locally += 1;
            return RouteOutcome::Local;
        }

        let result = match self.workers.get_mut(&msg.receiver) {
            Some(handle) => handle.deliver(&msg),
            None => Err(RouteError::UnknownReceiver(msg.receiver)),
        };
        match result {
            Ok(()) => {
                self.stats.delivered += 1;
                RouteOutcome::Delivered
            }
            Err(e) => {
                warn!(from = %msg.sender, to = %msg.receiver, kind = %msg.kind, error = %e, "message dropped");
                self.stats.dropped += 1;
                if let (RouteError::WorkerDead(agent), Some(handle)) = (&e, self.workers.get_mut(&msg.receiver)) {
                    if !handle.reported_dead {
                        handle.reported_dead = true;
                        warn!(agent = %agent, "worker is dead, no longer routed");
                    }
                }
                RouteOutcome::Dropped(e)
            }
        }
    }

    fn handle_local(&mut self, msg: &Message) {
        match msg.kind {
            MessageKind::TERMINATE => {
                info!(from = %msg.sender, "terminate requested");
                self.lifecycle.trigger(TerminationCause::Requested(msg.sender));
            }
            MessageKind::HEARTBEAT => {
                self.heartbeats.insert(msg.sender, Instant::now());
                if self.stale.remove(&msg.sender) {
                    info!(agent = %msg.sender, "heartbeat resumed");
                }
            }
            MessageKind::STATUS => info!(from = %msg.sender, status = %msg.payload, "status report"),
            _ => debug!(from = %msg.sender, kind = %msg.kind, "unhandled supervisor message"),
        }
    }

    /// Log workers that died or went quiet since the last check.
    pub fn check_workers(&mut self) {
        let stale_after = self.config.heartbeat_period() * STALE_HEARTBEAT_PERIODS;
        let now = Instant::now();
        for (agent, handle) in self.workers.iter_mut() {
            if !handle.is_alive() {
                if !handle.reported_dead {
                    handle.reported_dead = true;
                    warn!(agent = %agent, "worker exited, no longer routed");
                }
                continue;
            }
            let last = self
                .heartbeats
                .get(agent)
                .copied()
                .unwrap_or(handle.started_at);
            if now.duration_since(last) > stale_after && self.stale.insert(*agent) {
                warn!(agent = %agent, silent_for = ?now.duration_since(last), "heartbeat stale");
            }
        }
    }

    /// Main loop: route until termination begins, then shut down.
    pub async fn run(&mut self) -> ShutdownReport {
        let poll = self.config.queue_poll();
        let check_every = self.config.heartbeat_period();
        let terminate = self.lifecycle.terminate_token();
        let mut last_check = Instant::now();

        while self.lifecycle.is_running() {
            tokio::select! {
                _ = terminate.cancelled() => break,
                popped = tokio::time::timeout(poll, self.inbound_rx.recv()) => {
                    if let Ok(Some(line)) = popped {
                        self.route(&line);
                    }
                }
            }
            if last_check.elapsed() >= check_every {
                self.check_workers();
                last_check = Instant::now();
            }
        }

        self.shutdown().await
    }

    /// Broadcast `Terminate`, wait out the grace period, signal stragglers, wait the
    /// escalation window, force-kill whatever remains, and reap everything.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let started = Instant::now();
        let force = self.lifecycle.force_token();
        let mut report = ShutdownReport::default();

        for (agent, handle) in self.workers.iter_mut() {
            if !handle.is_alive() {
                report.already_dead.push(*agent);
            }
        }

        let mut pending = self.live_workers();
        if !force.is_cancelled() {
            info!(workers = pending.len(), "broadcasting terminate");
            for agent in &pending {
                if let Some(handle) = self.workers.get_mut(agent) {
                    if let Err(e) = handle.deliver(&Message::terminate(AgentId::Supervisor, *agent)) {
                        warn!(agent = %agent, error = %e, "terminate not delivered");
                    }
                }
            }
            let grace = self.config.grace_period();
            report.graceful = self.wait_for_exit(&mut pending, grace, &force).await;

            if !pending.is_empty() && !force.is_cancelled() {
                warn!(workers = ?pending, "grace period over, signalling");
                for agent in &pending {
                    if let Some(handle) = self.workers.get_mut(agent) {
                        handle.process.signal_terminate();
                    }
                }
                let escalation = self.config.escalation();
                report.signalled = self.wait_for_exit(&mut pending, escalation, &force).await;
            }
        }

        if !pending.is_empty() {
            warn!(workers = ?pending, "force-killing workers");
            for agent in &pending {
                if let Some(handle) = self.workers.get_mut(agent) {
                    handle.process.force_kill();
                }
            }
            report.killed = pending;
        }

        for (agent, mut handle) in std::mem::take(&mut self.workers) {
            handle.process.reap(agent).await;
        }

        self.lifecycle.mark_stopped();
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            graceful = report.graceful.len(),
            signalled = report.signalled.len(),
            killed = report.killed.len(),
            elapsed_ms = report.elapsed_ms,
            stats = ?self.stats,
            "supervisor stopped"
        );
        report
    }

    /// Wait up to `window` for `pending` workers to exit, draining the inbound queue
    /// meanwhile. Returns the agents that exited; `pending` keeps the rest.
    async fn wait_for_exit(
        &mut self,
        pending: &mut Vec<AgentId>,
        window: Duration,
        force: &CancellationToken,
    ) -> Vec<AgentId> {
        let deadline = tokio::time::Instant::now() + window;
        let mut exited = Vec::new();
        loop {
            let workers = &mut self.workers;
            pending.retain(|agent| {
                let alive = workers.get_mut(agent).is_some_and(WorkerHandle::is_alive);
                if !alive {
                    exited.push(*agent);
                }
                alive
            });
            if pending.is_empty() || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = force.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + SHUTDOWN_POLL)) => {}
                Some(line) = self.inbound_rx.recv() => {
                    debug!(line = line.trim_end(), "discarded during shutdown");
                }
            }
        }
        exited
    }
}
