//! Contains the events and functionality for monitoring the behavior of the connection pooling
//! of a `Client`.

use crate::{bson::oid::ObjectId, options::ServerAddress};

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool becomes ready.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// If the client is connected to a load balancer, only connections to the backing server
    /// with this id are cleared.
    pub service_id: Option<ObjectId>,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections connected to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection finishes its handshake and is ready for use.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// The reasons a connection may be closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection sat idle in the pool for longer than `maxIdleTimeMS`.
    Idle,

    /// The connection belongs to a previous pool generation.
    Stale,

    /// An error occurred on the connection.
    Error,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// Event emitted when a task begins checking out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// The reasons a checkout attempt may fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The `wait_queue_timeout` elapsed while waiting for a connection to be available.
    Timeout,

    /// An error occurred while trying to establish a connection.
    ConnectionError,
}

/// Event emitted when a checkout attempt fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason the checkout failed.
    pub reason: ConnectionCheckoutFailedReason,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is checked back into the pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// Applications can implement this trait to specify custom logic to run on each CMAP event sent
/// by the driver.
///
/// Handlers are invoked synchronously and must not block.
pub trait CmapEventHandler: Send + Sync {
    /// A `Client` will call this method on each registered handler whenever a connection pool is
    /// created.
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection pool
    /// becomes ready.
    fn handle_pool_ready_event(&self, _event: PoolReadyEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection pool is
    /// cleared.
    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection pool is
    /// closed.
    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection is
    /// created.
    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection finishes
    /// its handshake.
    fn handle_connection_ready_event(&self, _event: ConnectionReadyEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection is
    /// closed.
    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a task begins
    /// checking out a connection.
    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a checkout attempt
    /// fails.
    fn handle_connection_checkout_failed_event(&self, _event: ConnectionCheckoutFailedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection is
    /// checked out.
    fn handle_connection_checked_out_event(&self, _event: ConnectionCheckedOutEvent) {}

    /// A `Client` will call this method on each registered handler whenever a connection is
    /// checked back in.
    fn handle_connection_checked_in_event(&self, _event: ConnectionCheckedInEvent) {}
}
