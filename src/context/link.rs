//! Connection to the GPU-serving process.
//!
//! The byte-level protocol is not part of this crate; a context only needs
//! to open a connection, wait for task completions and close it again.
//! [`LoopbackLink`] connects clients and servers living in one process
//! through tokio channels.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use super::shared::SharedContextId;
use crate::error::{Result, StoreError};

/// Socket descriptor of a client/server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketFd(pub i32);

/// Client side of the GPU-server connection.
pub trait ServerLink: Send + Sync {
    /// Connect to a GPU server on behalf of a shared context.
    fn open_connection(&self, shared: SharedContextId) -> Result<SocketFd>;

    /// Block until at least one task completes; returns how many did.
    fn recv_completions(&self, socket: SocketFd) -> Result<u32>;

    fn close(&self, socket: SocketFd) -> Result<()>;
}

/// Readiness registration on the server side.
pub trait Poller: Send + Sync {
    fn register(&self, socket: SocketFd) -> Result<()>;
}

const FIRST_LOOPBACK_FD: i32 = 1000;

#[derive(Debug)]
struct Connection {
    completions: UnboundedSender<u32>,
    receiver: Arc<tokio::sync::Mutex<UnboundedReceiver<u32>>>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    next_fd: i32,
    connections: HashMap<SocketFd, Connection>,
    pending: VecDeque<(SocketFd, SharedContextId)>,
    registered: HashSet<SocketFd>,
}

/// In-process link and poller.
#[derive(Debug, Clone)]
pub struct LoopbackLink {
    state: Arc<Mutex<LoopbackState>>,
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                next_fd: FIRST_LOOPBACK_FD,
                ..Default::default()
            })),
        }
    }

    /// Next connection waiting for a server to attach.
    pub fn accept(&self) -> Option<(SocketFd, SharedContextId)> {
        self.state.lock().pending.pop_front()
    }

    /// Sender used by the serving side to report completed tasks.
    pub fn completion_sender(&self, socket: SocketFd) -> Option<UnboundedSender<u32>> {
        self.state
            .lock()
            .connections
            .get(&socket)
            .map(|c| c.completions.clone())
    }

    pub fn is_open(&self, socket: SocketFd) -> bool {
        self.state.lock().connections.contains_key(&socket)
    }

    pub fn is_registered(&self, socket: SocketFd) -> bool {
        self.state.lock().registered.contains(&socket)
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }
}

impl ServerLink for LoopbackLink {
    fn open_connection(&self, shared: SharedContextId) -> Result<SocketFd> {
        let mut state = self.state.lock();
        let socket = SocketFd(state.next_fd);
        state.next_fd += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(
            socket,
            Connection {
                completions: tx,
                receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            },
        );
        state.pending.push_back((socket, shared));
        debug!(socket = socket.0, shared = shared.0, "Opened loopback connection");
        Ok(socket)
    }

    fn recv_completions(&self, socket: SocketFd) -> Result<u32> {
        let receiver = self
            .state
            .lock()
            .connections
            .get(&socket)
            .map(|c| Arc::clone(&c.receiver))
            .ok_or_else(|| {
                StoreError::ProtocolViolation(format!("socket {} is not connected", socket.0))
            })?;

        // The state lock is not held while blocking.
        let mut rx = receiver.blocking_lock();
        rx.blocking_recv().ok_or_else(|| {
            StoreError::ProtocolViolation(format!("GPU server closed socket {}", socket.0))
        })
    }

    fn close(&self, socket: SocketFd) -> Result<()> {
        let mut state = self.state.lock();
        state.registered.remove(&socket);
        state.pending.retain(|(s, _)| *s != socket);
        // Both ends share one entry; the second close finds it gone.
        if state.connections.remove(&socket).is_some() {
            debug!(socket = socket.0, "Closed loopback connection");
        }
        Ok(())
    }
}

impl Poller for LoopbackLink {
    fn register(&self, socket: SocketFd) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(&socket) {
            return Err(StoreError::ProtocolViolation(format!(
                "cannot poll unknown socket {}",
                socket.0
            )));
        }
        state.registered.insert(socket);
        Ok(())
    }
}
