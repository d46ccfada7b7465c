use std::net::SocketAddr;

use bscomp_rdma_protocol::{encode_frame_with_limits, FrameParser, Status};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::session::{Next, PeerSession};
use crate::PeerConfig;

const READ_CHUNK: usize = 64 * 1024;

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting, drops every open session and waits for the accept loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub async fn start_server(cfg: PeerConfig) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(cfg.bind_addr).await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(accept_loop(listener, cfg, shutdown_rx));

    Ok(ServerHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn accept_loop(listener: TcpListener, cfg: PeerConfig, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let cfg = cfg.clone();
                    sessions.spawn(async move {
                        if let Err(err) = serve(stream, &cfg).await {
                            tracing::debug!(%peer, "rdma session ended: {err:#}");
                        }
                    });
                }
                Err(err) => tracing::warn!("accept failed: {err}"),
            },
            // Reap finished sessions so the set does not grow without bound.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    sessions.shutdown().await;
}

async fn serve(mut stream: TcpStream, cfg: &PeerConfig) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    tracing::info!(%peer, "rdma session opened");

    let mut session = PeerSession::new(cfg.capacity);
    let mut parser = FrameParser::with_limits(cfg.limits);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            parser.finish()?;
            tracing::info!(%peer, "rdma session closed by device");
            return Ok(());
        }

        for request in parser.push(&buf[..n])? {
            if request.response {
                anyhow::bail!("device sent a response frame for request {}", request.request_id);
            }
            let (reply, next) = session.handle(&request);
            tracing::trace!(
                %peer,
                request_id = request.request_id,
                op = ?request.op,
                status = %reply.status,
                "rdma request"
            );
            let bytes = match encode_frame_with_limits(&reply, &cfg.limits) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::debug!(%peer, request_id = request.request_id, "reply not sendable: {err}");
                    let refusal = request.reply(Status::BadRequest, Vec::new());
                    encode_frame_with_limits(&refusal, &cfg.limits)?
                }
            };
            stream.write_all(&bytes).await?;

            if next == Next::Close {
                stream.shutdown().await?;
                tracing::info!(%peer, "rdma session closed");
                return Ok(());
            }
        }
    }
}
