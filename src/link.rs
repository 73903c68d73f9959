//! Physical link transport for uplink and downlink lines.
//!
//! The Comm agent sees a [`LinkPort`]; the ground side is either a TCP line server
//! (one client per ground station) or, in tests, a [`GroundEndpoint`] used directly.

use crate::error::LinkError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const UPLINK_BUFFER_SIZE: usize = 64;
const DOWNLINK_BROADCAST_BUFFER_SIZE: usize = 256;
/// Longest uplink line accepted from a client before the connection is dropped.
const MAX_UPLINK_LINE: usize = 256;

#[derive(Debug)]
pub enum LinkRead {
    Line(String),
    Idle,
    /// No ground side can ever send again.
    Closed,
}

/// Vehicle side of the link.
#[derive(Debug)]
pub struct LinkPort {
    pub uplink: Uplink,
    pub downlink: Downlink,
}

#[derive(Debug)]
pub struct Uplink {
    rx: mpsc::Receiver<String>,
}

impl Uplink {
    /// Read one uplink line, waiting at most `timeout`.
    pub async fn read_line(&mut self, timeout: Duration) -> LinkRead {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(line)) => LinkRead::Line(line),
            Ok(None) => LinkRead::Closed,
            Err(_) => LinkRead::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Downlink {
    tx: broadcast::Sender<String>,
}

impl Downlink {
    /// Hand a line to the transmitter. Returns the number of ground stations reached.
    pub fn write_line(&self, line: &str) -> Result<usize, LinkError> {
        self.tx
            .send(line.to_string())
            .map_err(|_| LinkError::NoListener)
    }
}

/// Ground side of the link.
#[derive(Debug, Clone)]
pub struct GroundEndpoint {
    pub uplink: mpsc::Sender<String>,
    downlink: broadcast::Sender<String>,
}

impl GroundEndpoint {
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.downlink.subscribe()
    }

    pub async fn send_command(&self, line: &str) -> Result<(), LinkError> {
        self.uplink
            .send(line.trim_end().to_string())
            .await
            .map_err(|_| LinkError::NoListener)
    }
}

pub fn link_pair() -> (LinkPort, GroundEndpoint) {
    let (uplink_tx, uplink_rx) = mpsc::channel(UPLINK_BUFFER_SIZE);
    let (downlink_tx, _) = broadcast::channel(DOWNLINK_BROADCAST_BUFFER_SIZE);
    (
        LinkPort {
            uplink: Uplink { rx: uplink_rx },
            downlink: Downlink {
                tx: downlink_tx.clone(),
            },
        },
        GroundEndpoint {
            uplink: uplink_tx,
            downlink: downlink_tx,
        },
    )
}

/// Bind the ground-link listener. Split from [`serve_ground_link`] so bind errors
/// surface before the Comm loops start.
pub async fn bind_ground_link(addr: &str) -> Result<TcpListener, LinkError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "ground link listening");
    Ok(listener)
}

/// Accept ground stations until `cancel` fires.
pub async fn serve_ground_link(
    listener: TcpListener,
    ground: GroundEndpoint,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(%addr, "ground station connected");
                    let client_ground = ground.clone();
                    let client_cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, addr, client_ground, client_cancel).await {
                            warn!(%addr, error = %e, "ground station error");
                        }
                        info!(%addr, "ground station disconnected");
                    });
                }
                Err(e) => error!(error = %e, "failed to accept ground station"),
            },
        }
    }
    debug!("ground link stopped");
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    ground: GroundEndpoint,
    cancel: CancellationToken,
) -> Result<(), LinkError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut downlink_rx = ground.subscribe();

    let downlink_task = tokio::spawn(async move {
        loop {
            match downlink_rx.recv().await {
                Ok(line) => {
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        warn!(%addr, error = %e, "downlink write failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(%addr, missed, "ground station too slow, downlink lines skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut line = String::new();
    let result = loop {
        line.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            read = reader.read_line(&mut line) => read,
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(_) if line.len() > MAX_UPLINK_LINE => {
                warn!(%addr, len = line.len(), "uplink line too long, closing");
                break Ok(());
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                debug!(%addr, line = trimmed, "uplink");
                if ground.send_command(trimmed).await.is_err() {
                    break Err(LinkError::NoListener);
                }
            }
            Err(e) => break Err(LinkError::Io(e)),
        }
    };

    downlink_task.abort();
    result
}
