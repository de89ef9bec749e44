use std::sync::atomic::{AtomicU32, Ordering};

use crate::{cmap::ConnectionPool, options::ServerAddress};

/// Contains the state for a given server in the topology: its connection pool and the count of
/// operations currently executing against it (used by the "power of two choices" selection
/// tie-break).
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    pub(crate) pool: ConnectionPool,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, pool: ConnectionPool) -> Self {
        Self {
            address,
            pool,
            operation_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }
}
