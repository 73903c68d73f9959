//! Worker runtime shared by every agent.
//!
//! A worker owns one receive-pipe (lines from the supervisor) and one send handle into
//! the supervisor's shared inbound queue. It never talks to another worker directly.
//! The same [`WorkerContext`] is used whether the worker is a child process (pipes are
//! stdin/stdout) or a task inside the supervisor (pipes are channels).

use crate::agents::{AgentId, MessageKind};
use crate::config::FswConfig;
use crate::error::WorkerError;
use crate::message::{pack, unpack, Message};
use std::future::Future;
use std::io::BufRead;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of every pipe and of the shared inbound queue, in lines.
pub const PIPE_CAPACITY: usize = 256;
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

pub type WorkerFuture = Pin<Box<dyn Future<Output = Result<(), WorkerError>> + Send>>;

/// Entry point of one agent.
pub type WorkerEntry = fn(WorkerContext) -> WorkerFuture;

/// Send handle into the shared inbound queue. Sends are fire-and-forget.
#[derive(Debug, Clone)]
pub struct Outbox {
    agent: AgentId,
    queue: mpsc::Sender<String>,
}

impl Outbox {
    pub fn new(agent: AgentId, queue: mpsc::Sender<String>) -> Self {
        Self { agent, queue }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// Address a message from this agent. Returns `false` if it was dropped.
    pub fn send(&self, receiver: AgentId, kind: MessageKind, payload: impl Into<String>) -> bool {
        self.send_message(&Message::new(self.agent, receiver, kind, payload))
    }

    pub fn send_message(&self, msg: &Message) -> bool {
        match self.queue.try_send(pack(msg)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(agent = %self.agent, receiver = %msg.receiver, kind = %msg.kind, "inbound queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(agent = %self.agent, "inbound queue closed");
                false
            }
        }
    }
}

/// Result of one bounded read of the receive-pipe.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    /// Nothing arrived within the read timeout, or the line was discarded.
    Idle,
    Terminate,
}

pub struct WorkerContext {
    pub agent: AgentId,
    pub config: Arc<FswConfig>,
    inbox: mpsc::Receiver<String>,
    outbox: Outbox,
    cancel: CancellationToken,
}

impl WorkerContext {
    pub fn new(
        agent: AgentId,
        config: Arc<FswConfig>,
        inbox: mpsc::Receiver<String>,
        queue: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            config,
            inbox,
            outbox: Outbox::new(agent, queue),
            cancel,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Run-flag of this worker; cancelled on `Terminate`, on a closed pipe, or by a signal.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Wait at most the configured read timeout for the next line from the supervisor.
    pub async fn next_inbound(&mut self) -> Inbound {
        let timeout = self.config.worker_read_timeout();
        tokio::select! {
            _ = self.cancel.cancelled() => Inbound::Terminate,
            read = tokio::time::timeout(timeout, self.inbox.recv()) => match read {
                Err(_) => Inbound::Idle,
                Ok(None) => {
                    debug!(agent = %self.agent, "receive-pipe closed");
                    self.cancel.cancel();
                    Inbound::Terminate
                }
                Ok(Some(line)) => self.decode(&line),
            },
        }
    }

    fn decode(&mut self, line: &str) -> Inbound {
        match unpack(line) {
            Ok(msg) if msg.kind == MessageKind::TERMINATE => {
                info!(agent = %self.agent, from = %msg.sender, "terminate received");
                self.cancel.cancel();
                Inbound::Terminate
            }
            Ok(msg) if msg.receiver != self.agent => {
                warn!(agent = %self.agent, receiver = %msg.receiver, "message for another agent discarded");
                Inbound::Idle
            }
            Ok(msg) => Inbound::Message(msg),
            Err(e) => {
                warn!(agent = %self.agent, error = %e, line = line.trim_end(), "malformed line discarded");
                Inbound::Idle
            }
        }
    }
}

/// Behaviour of a single-loop agent. Errors returned from these hooks are fatal to the
/// worker; recoverable problems are logged inside the hook.
pub trait Agent: Send {
    fn on_start(&mut self, _out: &Outbox) {}

    fn on_message(&mut self, msg: &Message, out: &Outbox) -> Result<(), WorkerError>;

    fn on_tick(&mut self, _out: &Outbox) -> Result<(), WorkerError> {
        Ok(())
    }

    fn tick_period(&self) -> Option<Duration> {
        None
    }

    fn on_stop(&mut self, _out: &Outbox) {}
}

/// Standard worker loop: bounded reads, a liveness heartbeat to the supervisor, and an
/// optional periodic tick.
pub async fn run_agent<A: Agent>(mut ctx: WorkerContext, mut agent: A) -> Result<(), WorkerError> {
    let name = ctx.agent;
    info!(agent = %name, "worker started");
    agent.on_start(&ctx.outbox);

    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_period());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tick = agent.tick_period().map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            inbound = ctx.next_inbound() => match inbound {
                Inbound::Terminate => break,
                Inbound::Idle => {}
                Inbound::Message(msg) => agent.on_message(&msg, &ctx.outbox)?,
            },
            _ = heartbeat.tick() => {
                ctx.outbox.send(AgentId::Supervisor, MessageKind::HEARTBEAT, "");
            }
            _ = next_tick(&mut tick) => agent.on_tick(&ctx.outbox)?,
        }
    }

    agent.on_stop(&ctx.outbox);
    info!(agent = %name, "worker stopped");
    Ok(())
}

async fn next_tick(tick: &mut Option<tokio::time::Interval>) {
    match tick {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Host one agent as a child process: stdin is the receive-pipe, stdout feeds the
/// supervisor's inbound queue. Logs must go to stderr.
pub async fn run_worker_process(
    agent: AgentId,
    config: FswConfig,
    entry: WorkerEntry,
) -> Result<(), WorkerError> {
    let cancel = CancellationToken::new();
    let (inbox_tx, inbox_rx) = mpsc::channel::<String>(PIPE_CAPACITY);
    let (queue_tx, mut queue_rx) = mpsc::channel::<String>(PIPE_CAPACITY);

    // Blocking stdin reads cannot be cancelled; a plain thread dies with the process.
    std::thread::Builder::new()
        .name(format!("{agent}-stdin"))
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if inbox_tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(agent = %agent, error = %e, "receive-pipe read failed");
                        break;
                    }
                }
            }
        })?;

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = queue_rx.recv().await {
            let written = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.flush().await
            };
            if let Err(e) = written.await {
                // Supervisor is gone; nothing left to talk to
                warn!(agent = %agent, error = %e, "send pipe broken");
                break;
            }
        }
    });

    spawn_signal_watch(agent, cancel.clone());

    let ctx = WorkerContext::new(agent, Arc::new(config), inbox_rx, queue_tx, cancel);
    let result = entry(ctx).await;
    if let Err(e) = &result {
        error!(agent = %agent, error = %e, "worker failed");
    }

    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(agent = %agent, "send pipe did not drain before exit");
    }
    result
}

/// The supervisor orchestrates shutdown; a worker treats SIGTERM as its run-flag and
/// ignores terminal interrupts aimed at the whole process group.
fn spawn_signal_watch(agent: AgentId, cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(agent = %agent, error = %e, "cannot install SIGTERM handler");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = term.recv() => {
                        info!(agent = %agent, "SIGTERM received");
                        cancel.cancel();
                        return;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        debug!(agent = %agent, "interrupt ignored, waiting for supervisor");
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (agent, cancel);
        }
    });
}
