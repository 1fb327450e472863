//! Inbound connection listener
//!
//! Binds the peer's listening port and accepts connections until stopped.
//! Each accepted connection is handed to the connection handler callback and
//! spawned as its own task, so accepting never waits on handler work.
//! Handlers are not tracked: stopping the listener closes the listening
//! socket only, and in-flight handlers end on their own.

use crate::{Error, Result};
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback that turns an accepted connection into a handler task
pub type ConnectionHandler = Arc<dyn Fn(TcpStream, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifecycle of the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No socket bound
    Stopped,
    /// Binding the socket
    Starting,
    /// Accept loop running
    Listening,
    /// Waiting for the accept loop to exit
    Stopping,
}

/// Inbound listener
pub struct Listener {
    state: ListenerState,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Create a stopped listener
    pub fn new() -> Self {
        Self {
            state: ListenerState::Stopped,
            local_addr: None,
            shutdown: None,
            accept_task: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Address the socket is bound to while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind `host:port` and start accepting connections
    ///
    /// A listener that is already running is stopped first, so the old
    /// socket is always released before the new one is bound. Bind failures
    /// are returned as [`Error::Bind`] and leave the listener stopped.
    pub async fn start(&mut self, host: &str, port: u16, handler: ConnectionHandler) -> Result<SocketAddr> {
        if self.state != ListenerState::Stopped {
            self.stop().await;
        }

        self.state = ListenerState::Starting;
        let socket = match TcpListener::bind((host, port)).await {
            Ok(socket) => socket,
            Err(source) => {
                error!("Failed to start listener on {}:{}: {}", host, port, source);
                self.state = ListenerState::Stopped;
                return Err(Error::Bind { port, source });
            }
        };

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.state = ListenerState::Stopped;
                return Err(Error::Bind { port, source });
            }
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.accept_task = Some(tokio::spawn(accept_loop(socket, shutdown_rx, handler)));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.state = ListenerState::Listening;

        info!("Listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Close the listening socket and wait for the accept loop to exit
    ///
    /// Calling this on a stopped listener does nothing.
    pub async fn stop(&mut self) {
        if self.state == ListenerState::Stopped {
            return;
        }

        self.state = ListenerState::Stopping;
        if let Some(shutdown) = self.shutdown.take() {
            // The receiver is gone only if the accept loop already exited
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }

        if let Some(addr) = self.local_addr.take() {
            info!("Listener on {} stopped", addr);
        }
        self.state = ListenerState::Stopped;
    }
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(socket: TcpListener, mut shutdown: watch::Receiver<bool>, handler: ConnectionHandler) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = socket.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted connection from {}", remote_addr);
                        tokio::spawn(handler(stream, remote_addr));
                    }
                    Err(e) => {
                        // e.g. EMFILE; back off before retrying
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    // Dropping `socket` here closes the listening port
}
