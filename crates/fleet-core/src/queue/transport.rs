//! Length-framed signed JSON over TCP
//!
//! One message per connection: a producer connects, writes a single
//! frame, and either disconnects (fire-and-forget) or waits for a single
//! reply frame (RPC). Frames are a big-endian u32 length followed by the
//! JSON envelope.

use super::{Command, Envelope, QueueError, QueueMessage, RpcRequest, SignedCodec};
use crate::health::{HealthBoard, Subsystem};
use crate::observability::FleetMetrics;
use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Upper bound on one frame; anything larger is a protocol violation.
const MAX_FRAME_BYTES: usize = 1 << 20;

async fn write_frame(stream: &mut TcpStream, env: &Envelope) -> Result<()> {
    let body = serde_json::to_vec(env)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(QueueError::Oversize(body.len()).into());
    }
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Envelope> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(QueueError::Oversize(len).into());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(10),
        }
    }
}

/// Producer side of the bus.
///
/// Timeouts and connect failures surface as errors to the one caller;
/// the peer is presumed down and nothing is retried here.
pub struct JobSender {
    codec: SignedCodec,
    cfg: SenderConfig,
}

impl JobSender {
    pub fn new(codec: SignedCodec, cfg: SenderConfig) -> Self {
        Self { codec, cfg }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        timeout(self.cfg.connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to {addr}"))?
            .with_context(|| format!("could not connect to {addr}"))
    }

    /// Fire-and-forget: enqueue a command on a daemon and return without
    /// waiting for execution.
    pub async fn send(&self, addr: &str, cmd: Command, data: Value) -> Result<()> {
        let env = self.codec.encode(cmd.into(), data)?;
        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, &env).await?;
        debug!(%addr, cmd = ?cmd, "queued command");
        Ok(())
    }

    /// Synchronous RPC against a specific peer: send a signed request
    /// and wait (bounded) for its signed reply.
    pub async fn send_recv(&self, addr: &str, cmd: Command, data: Value) -> Result<Value> {
        let env = self.codec.encode(cmd.into(), data)?;
        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, &env).await?;
        let reply = timeout(self.cfg.recv_timeout, read_frame(&mut stream))
            .await
            .with_context(|| format!("timed out waiting for reply from {addr}"))??;
        self.codec.verify(&reply)?;
        Ok(reply.data)
    }
}

/// Daemon side of the bus: accept loops feeding in-process channels, one
/// lane per traffic class so a burst of offline work never starves
/// status queries.
pub struct QueueServer {
    codec: Arc<SignedCodec>,
    metrics: FleetMetrics,
    /// How long a connection handler waits for the daemon loop to answer
    /// an RPC before giving up on the peer's behalf.
    reply_timeout: Duration,
}

impl QueueServer {
    pub fn new(codec: Arc<SignedCodec>) -> Self {
        Self {
            codec,
            metrics: FleetMetrics::new(),
            reply_timeout: Duration::from_secs(10),
        }
    }

    /// Accept loop for the fire-and-forget lane. Runs until the shutdown
    /// signal fires.
    pub async fn serve_jobs(
        &self,
        listener: TcpListener,
        tx: mpsc::Sender<QueueMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(addr = ?listener.local_addr().ok(), "job lane listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "job lane accept failed");
                            continue;
                        }
                    };
                    let codec = Arc::clone(&self.codec);
                    let tx = tx.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_job_conn(codec, stream, tx).await {
                            if err.downcast_ref::<QueueError>().is_some() {
                                metrics.inc_queue_rejections();
                            }
                            warn!(%peer, error = %err, "dropped queue message");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("job lane shutting down");
                    return;
                }
            }
        }
    }

    /// Accept loop for the RPC lane.
    pub async fn serve_rpc(
        &self,
        listener: TcpListener,
        tx: mpsc::Sender<RpcRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(addr = ?listener.local_addr().ok(), "rpc lane listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "rpc lane accept failed");
                            continue;
                        }
                    };
                    let codec = Arc::clone(&self.codec);
                    let tx = tx.clone();
                    let reply_timeout = self.reply_timeout;
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_rpc_conn(codec, stream, tx, reply_timeout).await {
                            if err.downcast_ref::<QueueError>().is_some() {
                                metrics.inc_queue_rejections();
                            }
                            warn!(%peer, error = %err, "dropped rpc request");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("rpc lane shutting down");
                    return;
                }
            }
        }
    }
}

/// Watches both accept loops and flags the queue subsystem on the health
/// board if either returns before shutdown was signalled. A dead lane
/// means the node silently stops taking commands, which readiness must
/// surface.
pub async fn watch_lanes(
    job_lane: JoinHandle<()>,
    rpc_lane: JoinHandle<()>,
    health: HealthBoard,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = shutdown.recv() => {}
        _ = job_lane => health.report_failed(Subsystem::Queue, "job lane listener exited"),
        _ = rpc_lane => health.report_failed(Subsystem::Queue, "rpc lane listener exited"),
    }
}

async fn verify_incoming(codec: &SignedCodec, stream: &mut TcpStream) -> Result<QueueMessage> {
    let env = read_frame(stream).await?;
    codec.verify(&env)?;
    let cmd = Command::try_from(env.cmd)?;
    Ok(QueueMessage {
        cmd,
        data: env.data,
    })
}

async fn handle_job_conn(
    codec: Arc<SignedCodec>,
    mut stream: TcpStream,
    tx: mpsc::Sender<QueueMessage>,
) -> Result<()> {
    let msg = verify_incoming(&codec, &mut stream).await?;
    tx.send(msg).await.context("daemon loop gone")?;
    Ok(())
}

async fn handle_rpc_conn(
    codec: Arc<SignedCodec>,
    mut stream: TcpStream,
    tx: mpsc::Sender<RpcRequest>,
    reply_timeout: Duration,
) -> Result<()> {
    let msg = verify_incoming(&codec, &mut stream).await?;
    let cmd = msg.cmd;
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(RpcRequest {
        cmd,
        data: msg.data,
        reply: reply_tx,
    })
    .await
    .context("daemon loop gone")?;

    let answer = timeout(reply_timeout, reply_rx)
        .await
        .context("daemon loop did not answer in time")?
        .context("daemon loop dropped the request")?;
    let env = codec.encode(cmd.into(), answer)?;
    write_frame(&mut stream, &env).await?;
    Ok(())
}
