//! Connection registry.
//!
//! # Responsibilities
//! - Allocate handles and index connections by handle and by socket
//! - Reference-count connections; recycle sessions through a pool
//! - Enforce the configured connection capacity
//!
//! # Design Decisions
//! - Both indices change together under one lock, never held across I/O
//! - A connection starts with two references: the index entry and the
//!   accept event. It is recycled when the count reaches zero
//! - Lookups hand out [`ConnectionLease`]s that release on drop

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::net::connection::{ClientConnection, Outbound, Session};
use crate::net::handle::{Handle, HandleError, SocketId, Snowflake};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection capacity of {0} reached")]
    CapacityExceeded(usize),
    #[error("registry capacity must be greater than zero")]
    ZeroCapacity,
    #[error(transparent)]
    Handle(#[from] HandleError),
}

#[derive(Debug)]
struct Inner {
    by_handle: HashMap<Handle, Arc<ClientConnection>>,
    by_socket: HashMap<SocketId, Arc<ClientConnection>>,
    pool: Vec<Session>,
    snowflake: Snowflake,
}

/// Shared registry of live client connections.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
    buffer_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(worker: u16, capacity: usize, buffer_capacity: usize) -> Result<Self, RegistryError> {
        if capacity == 0 {
            return Err(RegistryError::ZeroCapacity);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                by_handle: HashMap::with_capacity(capacity.min(4096)),
                by_socket: HashMap::with_capacity(capacity.min(4096)),
                pool: Vec::new(),
                snowflake: Snowflake::new(worker)?,
            })),
            capacity,
            buffer_capacity,
        })
    }

    /// Install a freshly accepted socket.
    ///
    /// The returned lease is the accept event's reference. Fails without
    /// touching either index when the registry is full.
    pub fn occupy(
        &self,
        socket: SocketId,
        peer: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<ConnectionLease, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.by_handle.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded(self.capacity));
        }

        let handle = inner.snowflake.next_id();
        let session = inner
            .pool
            .pop()
            .unwrap_or_else(|| Session::new(self.buffer_capacity));
        let conn = Arc::new(ClientConnection::new(handle, socket, peer, session, outbound));

        inner.by_handle.insert(handle, Arc::clone(&conn));
        inner.by_socket.insert(socket, Arc::clone(&conn));

        Ok(ConnectionLease {
            registry: self.clone(),
            conn,
        })
    }

    /// Look up by handle, taking a reference.
    pub fn grab(&self, handle: Handle) -> Option<ConnectionLease> {
        let inner = self.inner.lock();
        let conn = inner.by_handle.get(&handle)?;
        Some(self.lease(conn))
    }

    /// Look up by socket id, taking a reference.
    pub fn grab_by_socket(&self, socket: SocketId) -> Option<ConnectionLease> {
        let inner = self.inner.lock();
        let conn = inner.by_socket.get(&socket)?;
        Some(self.lease(conn))
    }

    /// Lease every live connection.
    pub fn grab_all(&self) -> Vec<ConnectionLease> {
        let inner = self.inner.lock();
        inner.by_handle.values().map(|conn| self.lease(conn)).collect()
    }

    fn lease(&self, conn: &Arc<ClientConnection>) -> ConnectionLease {
        conn.acquire();
        ConnectionLease {
            registry: self.clone(),
            conn: Arc::clone(conn),
        }
    }

    /// Remove `handle` from both indices and drop the index reference.
    pub fn erase(&self, handle: Handle) -> bool {
        let mut inner = self.inner.lock();
        let Some(conn) = inner.by_handle.remove(&handle) else {
            return false;
        };
        inner.by_socket.remove(&conn.socket());
        Self::release_locked(&mut inner, &conn, self.capacity);
        true
    }

    /// Drop one reference; recycles the connection at zero.
    pub fn release(&self, conn: &Arc<ClientConnection>) {
        let mut inner = self.inner.lock();
        Self::release_locked(&mut inner, conn, self.capacity);
    }

    fn release_locked(inner: &mut Inner, conn: &Arc<ClientConnection>, capacity: usize) {
        if conn.decrement() > 0 {
            return;
        }

        let handle = conn.handle();
        if inner
            .by_handle
            .get(&handle)
            .is_some_and(|c| Arc::ptr_eq(c, conn))
        {
            inner.by_handle.remove(&handle);
        }
        if inner
            .by_socket
            .get(&conn.socket())
            .is_some_and(|c| Arc::ptr_eq(c, conn))
        {
            inner.by_socket.remove(&conn.socket());
        }

        if let Some(mut session) = conn.take_session() {
            if inner.pool.len() < capacity {
                session.reset();
                inner.pool.push(session);
            }
        }
        tracing::trace!(handle = %handle, "Connection recycled");
    }

    /// Signal every live connection to close.
    pub fn close_all(&self) {
        for conn in self.grab_all() {
            conn.close();
        }
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.inner.lock().by_handle.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Sessions waiting in the pool.
    pub fn pooled(&self) -> usize {
        self.inner.lock().pool.len()
    }
}

/// A counted reference to a registered connection. Releases on drop.
#[derive(Debug)]
pub struct ConnectionLease {
    registry: ConnectionRegistry,
    conn: Arc<ClientConnection>,
}

impl ConnectionLease {
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.conn
    }
}

impl Deref for ConnectionLease {
    type Target = ClientConnection;

    fn deref(&self) -> &Self::Target {
        self.connection()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.registry.release(&self.conn);
    }
}
