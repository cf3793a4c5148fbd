//! # server
//!
//! why: one accept loop shared by the client, registration and participant endpoints
//! relations: hands each connection to a NetworkHandler on a WorkerPool thread
//! what: NetworkHandler, SocketServer

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;
use crate::wire::Connection;

/// Serves one accepted connection.
pub trait NetworkHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> Result<()>;
}

/// A bound listener plus the pool that serves it.
pub struct SocketServer {
    name: String,
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    pool: Arc<WorkerPool>,
}

impl SocketServer {
    /// Binds `addr` and starts accepting. Port 0 picks a free port; see `local_addr`.
    pub fn start(
        name: &str,
        addr: &str,
        workers: usize,
        handler: Arc<dyn NetworkHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        let pool = Arc::new(
            WorkerPool::new(name, workers)
                .with_context(|| format!("failed to start {name} workers"))?,
        );
        let stopping = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let pool = Arc::clone(&pool);
            let stopping = Arc::clone(&stopping);
            let name = name.to_string();
            thread::Builder::new()
                .name(format!("{name}-accept"))
                .spawn(move || accept_loop(&name, listener, &pool, handler, &stopping))
                .context("failed to spawn accept thread")?
        };
        info!(server = name, addr = %local_addr, "listening");

        Ok(Self {
            name: name.to_string(),
            local_addr,
            stopping,
            acceptor: Mutex::new(Some(acceptor)),
            pool,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, then waits for in-flight connections to finish.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // the accept loop only notices the flag once `accept` returns
        let _ = TcpStream::connect_timeout(&wake_addr(self.local_addr), Duration::from_secs(1));
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = acceptor {
            let _ = handle.join();
        }
        self.pool.shutdown();
        info!(server = %self.name, "stopped");
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    name: &str,
    listener: TcpListener,
    pool: &WorkerPool,
    handler: Arc<dyn NetworkHandler>,
    stopping: &AtomicBool,
) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(server = name, error = %err, "accept error");
                continue;
            }
        };
        let handler = Arc::clone(&handler);
        let submitted = pool.submit(move || {
            let conn = Connection::from_stream(stream)?;
            let peer = conn.peer().to_string();
            debug!(peer = %peer, "connection accepted");
            handler
                .handle(conn)
                .with_context(|| format!("connection from {peer}"))
        });
        if let Err(err) = submitted {
            warn!(server = name, error = %err, "dropping connection");
            break;
        }
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpc_core::Message;

    struct Echo;

    impl NetworkHandler for Echo {
        fn handle(&self, mut conn: Connection) -> Result<()> {
            while let Some(msg) = conn.recv()? {
                conn.send(&msg)?;
            }
            Ok(())
        }
    }

    #[test]
    fn serves_connections_on_an_ephemeral_port() {
        let server = SocketServer::start("echo", "127.0.0.1:0", 2, Arc::new(Echo)).unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let reply = crate::wire::call(
            &server.local_addr().to_string(),
            &Message::get_request("k"),
            Duration::from_secs(2),
        )
        .unwrap();

        assert_eq!(reply, Message::get_request("k"));
        server.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_releases_the_port() {
        let server = SocketServer::start("echo", "127.0.0.1:0", 1, Arc::new(Echo)).unwrap();
        let addr = server.local_addr();

        server.shutdown();
        server.shutdown();

        assert!(crate::wire::call(
            &addr.to_string(),
            &Message::get_request("k"),
            Duration::from_millis(300)
        )
        .is_err());
    }
}
