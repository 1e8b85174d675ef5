use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpSocket},
    sync::Notify,
    time::timeout,
};
use tracing::{error, info};

use crate::config::Config;
use crate::session::Session;

/// Upper bound on a single accept wait. Purely so shutdown is observed
/// promptly; not a data timeout.
const ACCEPT_WAIT: Duration = Duration::from_secs(2);

/// Membership entry for one live session. The registry never touches a
/// session's sockets; termination is signalled through the notify handle.
struct SessionHandle {
    peer: SocketAddr,
    shutdown: Arc<Notify>,
}

/// Bookkeeping for every live session, shared between the acceptor and the
/// sessions themselves. The lock is held only for insert, remove, and the
/// shutdown snapshot.
pub struct Registry {
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a newly accepted connection, handing back the session id
    /// and its termination signal. Refused once shutdown has begun.
    pub fn register(&self, peer: SocketAddr) -> Option<(u64, Arc<Notify>)> {
        let mut sessions = self.sessions.lock().unwrap();
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let shutdown = Arc::new(Notify::new());
        sessions.insert(
            id,
            SessionHandle {
                peer,
                shutdown: shutdown.clone(),
            },
        );
        Some((id, shutdown))
    }

    /// Removes a session from the registry. Idempotent: removing an unknown
    /// id is a no-op.
    pub fn remove(&self, id: u64) {
        self.sessions.lock().unwrap().remove(&id);
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the accept loop and signals every live session to terminate.
    /// Best-effort: does not wait for relays to drain.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<(SocketAddr, Arc<Notify>)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .map(|handle| (handle.peer, handle.shutdown.clone()))
                .collect()
        };
        for (peer, shutdown) in handles {
            info!(client_addr = %peer, "Terminating session");
            shutdown.notify_one();
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds the listening socket with address reuse and accepts until shutdown
/// or a fatal accept error. The listener is released when this returns.
pub async fn run(config: Arc<Config>, registry: Arc<Registry>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.listen.ip, config.listen.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.listen.ip, config.listen.port
            )
        })?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("Failed to create listening socket")?;
    socket
        .set_reuseaddr(true)
        .context("Failed to enable address reuse")?;
    socket
        .bind(addr)
        .with_context(|| format!("Failed to bind to address {addr}"))?;
    let listener = socket.listen(128).context("Failed to listen")?;

    info!(listen_addr = %addr, "Tunnel relay listening");
    accept_loop(&listener, &registry, &config).await;
    Ok(())
}

async fn accept_loop(listener: &TcpListener, registry: &Arc<Registry>, config: &Arc<Config>) {
    while registry.is_running() {
        let (stream, peer) = match timeout(ACCEPT_WAIT, listener.accept()).await {
            // Periodic wake so a running-flag change is noticed.
            Err(_) => continue,
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                error!(error = %e, "Accept failed; stopping listener");
                break;
            }
        };
        // A shutdown that raced this accept refuses registration; the
        // connection is simply dropped.
        let Some((id, shutdown)) = registry.register(peer) else {
            continue;
        };
        info!(client_addr = %peer, session_id = id, "Accepted connection");
        let session = Session::new(id, peer, shutdown, registry.clone(), config.clone());
        tokio::spawn(session.run(stream));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn register_assigns_unique_ids() {
        let registry = Registry::new();
        let (first, _) = registry.register(peer()).unwrap();
        let (second, _) = registry.register(peer()).unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.active_sessions(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let (id, _) = registry.register(peer()).unwrap();
        registry.remove(id);
        registry.remove(id);
        registry.remove(9999);
        assert_eq!(registry.active_sessions(), 0);
    }

    #[test]
    fn register_refused_after_shutdown() {
        let registry = Registry::new();
        registry.shutdown();
        assert!(!registry.is_running());
        assert!(registry.register(peer()).is_none());
    }

    #[tokio::test]
    async fn shutdown_signals_every_registered_session() {
        let registry = Registry::new();
        let (_, first) = registry.register(peer()).unwrap();
        let (_, second) = registry.register(peer()).unwrap();

        registry.shutdown();

        // notify_one leaves a permit, so a later wait completes immediately.
        timeout(Duration::from_millis(100), first.notified())
            .await
            .unwrap();
        timeout(Duration::from_millis(100), second.notified())
            .await
            .unwrap();
    }
}
