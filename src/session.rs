use anyhow::{Context, Result, anyhow};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream, lookup_host,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Notify,
    time::timeout,
};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::handshake::{self, Classification, HandshakeFields};
use crate::server::Registry;

pub const BUFFER_SIZE: usize = 16384;

/// Port assumed for a portless target. The session is always in the
/// CONNECT-method context by the time it dials out.
const CONNECT_FALLBACK_PORT: u16 = 443;

/// Legacy pre-negotiation marker some clients emit before tunneling; it is
/// swallowed rather than forwarded.
const ESTABLISHED_MARKER: &[u8] = b"HTTP/1.0 200 Connection established";

/// One accepted connection: classifies or forges the WebSocket handshake,
/// dials the backend, then relays bytes verbatim in both directions until
/// either side closes, an I/O fault occurs, or shutdown is signalled.
pub struct Session {
    id: u64,
    peer: SocketAddr,
    shutdown: Arc<Notify>,
    registry: Arc<Registry>,
    config: Arc<Config>,
    client_closed: AtomicBool,
    target_closed: AtomicBool,
}

impl Session {
    #[must_use]
    pub fn new(
        id: u64,
        peer: SocketAddr,
        shutdown: Arc<Notify>,
        registry: Arc<Registry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            id,
            peer,
            shutdown,
            registry,
            config,
            client_closed: AtomicBool::new(false),
            target_closed: AtomicBool::new(false),
        }
    }

    /// Drives the connection to completion and unregisters it, however it
    /// ends. Failures stay inside the session; they are logged, never
    /// propagated.
    pub async fn run(self, client: TcpStream) {
        if let Err(e) = self.drive(client).await {
            error!(client_addr = %self.peer, error = %e, "Session failed");
        }
        self.registry.remove(self.id);
    }

    async fn drive(&self, mut client: TcpStream) -> Result<()> {
        let mut head_buf = vec![0u8; BUFFER_SIZE];
        let read = tokio::select! {
            read = client.read(&mut head_buf) => {
                read.context("Failed to read initial bytes from client")?
            }
            () = self.shutdown.notified() => return Ok(()),
        };
        if read == 0 {
            debug!(client_addr = %self.peer, "Client sent no data");
            return Ok(());
        }

        let head = std::str::from_utf8(&head_buf[..read])
            .context("Initial bytes are not valid UTF-8 header text")?;
        let fields = HandshakeFields::parse(head);

        let (target_spec, forward_head) = match fields.classify() {
            Classification::Relay { target } => {
                info!(client_addr = %self.peer, "Client brought its own WebSocket handshake");
                (target, true)
            }
            Classification::Forge {
                upgrade,
                connection,
                key,
                target,
            } => {
                let accept = handshake::accept_token(&key);
                let response = handshake::upgrade_response(
                    &upgrade,
                    &connection,
                    &accept,
                    &self.config.reason_phrase,
                );
                client
                    .write_all(response.as_bytes())
                    .await
                    .context("Failed to send upgrade response to client")?;
                info!(client_addr = %self.peer, "Sent forged WebSocket upgrade response");
                (target, false)
            }
        };

        let target_spec = target_spec.unwrap_or_else(|| self.config.target.to_target_spec());
        let mut target = self.connect_target(&target_spec).await?;
        if forward_head {
            target
                .write_all(&head_buf[..read])
                .await
                .context("Failed to forward initial bytes to target")?;
        }

        self.relay(client, target).await;
        Ok(())
    }

    async fn connect_target(&self, spec: &str) -> Result<TcpStream> {
        let (host, port) = split_target(spec)?;
        debug!(client_addr = %self.peer, target = %spec, "Connecting to target");
        let addr = lookup_host((host, port))
            .await
            .with_context(|| format!("Failed to resolve target {host}:{port}"))?
            .next()
            .ok_or_else(|| anyhow!("Target {host}:{port} resolved to no addresses"))?;
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to target {addr}"))?;
        info!(client_addr = %self.peer, target_addr = %addr, "Connected to target");
        Ok(stream)
    }

    /// The two-way pump. Either direction ending, for any reason, tears the
    /// whole session down; the shutdown branch covers global termination.
    async fn relay(&self, client: TcpStream, target: TcpStream) {
        let idle = self.config.idle_timeout();
        let (mut client_rx, mut client_tx) = client.into_split();
        let (mut target_rx, mut target_tx) = target.into_split();

        let client_to_target = async {
            let mut buffer = [0u8; BUFFER_SIZE];
            loop {
                let read = match read_chunk(&mut client_rx, &mut buffer, idle).await {
                    Ok(0) => {
                        debug!(client_addr = %self.peer, "Client closed the stream");
                        break;
                    }
                    Ok(read) => read,
                    Err(e) => {
                        debug!(client_addr = %self.peer, error = %e, "Client read ended");
                        break;
                    }
                };
                let data = &buffer[..read];
                if data.starts_with(ESTABLISHED_MARKER) {
                    debug!(client_addr = %self.peer, "Swallowed pre-negotiation marker line");
                    continue;
                }
                if let Err(e) = target_tx.write_all(data).await {
                    debug!(client_addr = %self.peer, error = %e, "Target write ended");
                    break;
                }
            }
        };

        let target_to_client = async {
            let mut buffer = [0u8; BUFFER_SIZE];
            loop {
                let read = match read_chunk(&mut target_rx, &mut buffer, idle).await {
                    Ok(0) => {
                        debug!(client_addr = %self.peer, "Target closed the stream");
                        break;
                    }
                    Ok(read) => read,
                    Err(e) => {
                        debug!(client_addr = %self.peer, error = %e, "Target read ended");
                        break;
                    }
                };
                if let Err(e) = client_tx.write_all(&buffer[..read]).await {
                    debug!(client_addr = %self.peer, error = %e, "Client write ended");
                    break;
                }
            }
        };

        tokio::select! {
            () = client_to_target => {}
            () = target_to_client => {}
            () = self.shutdown.notified() => {
                debug!(client_addr = %self.peer, "Session terminated by shutdown");
            }
        }

        close_half(&self.client_closed, &mut client_tx, "client").await;
        close_half(&self.target_closed, &mut target_tx, "target").await;
        info!(client_addr = %self.peer, "Relay finished");
    }
}

async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> std::io::Result<usize> {
    match idle {
        Some(limit) => match timeout(limit, reader.read(buf)).await {
            Ok(read) => read,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "relay idle timeout",
            )),
        },
        None => reader.read(buf).await,
    }
}

/// Shuts down one write half at most once; repeat calls are no-ops and
/// failures are logged, never raised.
async fn close_half(closed: &AtomicBool, half: &mut OwnedWriteHalf, side: &str) {
    if closed.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(e) = half.shutdown().await {
        debug!(side, error = %e, "Socket shutdown failed");
    }
}

/// Splits a `host:port` target on its last colon; a portless target gets
/// the CONNECT fallback port.
fn split_target(spec: &str) -> Result<(&str, u16)> {
    match spec.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid port in target {spec}"))?;
            Ok((host, port))
        }
        None => Ok((spec, CONNECT_FALLBACK_PORT)),
    }
}
