pub(crate) mod conn;
pub(crate) mod establish;
pub(crate) mod options;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use tokio::sync::{Mutex, Notify};

use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    event::cmap::{
        CmapEventHandler, ConnectionCheckedInEvent, ConnectionCheckedOutEvent,
        ConnectionCheckoutFailedEvent, ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent, ConnectionClosedEvent, ConnectionClosedReason,
        ConnectionCreatedEvent, ConnectionReadyEvent, PoolClearedEvent, PoolClosedEvent,
        PoolCreatedEvent, PoolReadyEvent,
    },
    options::ServerAddress,
    runtime,
};

pub(crate) use self::conn::{Command, Connection, ConnectionInfo, RawCommandResponse, StreamDescription};
use self::{establish::ConnectionEstablisher, options::ConnectionPoolOptions};

const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// A pool of connections to one server, implementing the CMAP specification: bounded size, FIFO
/// reuse, a generation counter bumped on `clear`, and a paused state between a clear and the
/// server becoming known again.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    address: ServerAddress,
    establisher: ConnectionEstablisher,

    max_pool_size: u32,
    min_pool_size: u32,
    max_idle_time: Option<Duration>,
    wait_queue_timeout: Option<Duration>,
    load_balanced: bool,

    /// Bumped on `clear`; connections from older generations are closed on sight.
    generation: AtomicU32,

    /// In load-balanced mode clears are scoped to one backing server, so each `serviceId` gets
    /// its own generation and the global one is left alone.
    service_generations: std::sync::Mutex<HashMap<ObjectId, u32>>,

    /// Includes checked-out connections.
    total_connection_count: AtomicU32,

    next_connection_id: AtomicU32,

    /// A cleared pool stays paused until the server is confirmed alive; checkouts fail fast while
    /// paused rather than dialing a server that is known to be down.
    paused: AtomicBool,

    /// The error that caused the most recent clear, surfaced by checkouts on a paused pool.
    clear_cause: std::sync::Mutex<Option<Error>>,

    /// FIFO queue of idle connections. Checked out from the back, checked in at the back.
    available: Mutex<VecDeque<Connection>>,

    /// Signalled on checkin and on pool-ready, waking blocked checkouts.
    notify: Notify,

    event_handler: Option<Arc<dyn CmapEventHandler>>,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInner")
            .field("address", &self.address)
            .field("max_pool_size", &self.max_pool_size)
            .field("min_pool_size", &self.min_pool_size)
            .field("generation", &self.generation)
            .field("total_connection_count", &self.total_connection_count)
            .field("paused", &self.paused)
            .finish()
    }
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        event_handler: Option<Arc<dyn CmapEventHandler>>,
        options: ConnectionPoolOptions,
    ) -> Self {
        let load_balanced = options.load_balanced.unwrap_or(false);
        let inner = PoolInner {
            address: address.clone(),
            establisher,
            max_pool_size: options
                .max_pool_size
                .unwrap_or(self::options::DEFAULT_MAX_POOL_SIZE),
            min_pool_size: options.min_pool_size.unwrap_or(0),
            max_idle_time: options.max_idle_time,
            wait_queue_timeout: options.wait_queue_timeout,
            load_balanced,
            generation: AtomicU32::new(0),
            service_generations: std::sync::Mutex::new(HashMap::new()),
            total_connection_count: AtomicU32::new(0),
            next_connection_id: AtomicU32::new(1),
            // Load-balanced pools skip monitoring, so nothing would ever un-pause them.
            paused: AtomicBool::new(!load_balanced),
            clear_cause: std::sync::Mutex::new(None),
            available: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            event_handler,
        };

        let pool = Self {
            inner: Arc::new(inner),
        };

        pool.emit_event(|handler| {
            handler.handle_pool_created_event(PoolCreatedEvent {
                address: address.clone(),
            });
        });

        start_maintenance_task(Arc::downgrade(&pool.inner));

        pool
    }

    fn emit_event<F>(&self, emit: F)
    where
        F: FnOnce(&Arc<dyn CmapEventHandler>),
    {
        if let Some(ref handler) = self.inner.event_handler {
            emit(handler);
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection, establishing a new one if the pool is empty and under its size
    /// limit, or blocking until a checkin or the wait queue timeout otherwise.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        self.emit_event(|handler| {
            handler.handle_connection_checkout_started_event(ConnectionCheckoutStartedEvent {
                address: self.inner.address.clone(),
            });
        });

        let result = self.acquire_or_create_connection().await;

        let mut conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                let reason = if err.is_network_timeout() {
                    ConnectionCheckoutFailedReason::Timeout
                } else {
                    ConnectionCheckoutFailedReason::ConnectionError
                };
                self.emit_event(|handler| {
                    handler.handle_connection_checkout_failed_event(ConnectionCheckoutFailedEvent {
                        address: self.inner.address.clone(),
                        reason,
                    });
                });
                return Err(err);
            }
        };

        conn.mark_checked_out();

        self.emit_event(|handler| {
            handler.handle_connection_checked_out_event(ConnectionCheckedOutEvent {
                address: self.inner.address.clone(),
                connection_id: conn.id,
            });
        });

        Ok(conn)
    }

    async fn acquire_or_create_connection(&self) -> Result<Connection> {
        let deadline = self
            .inner
            .wait_queue_timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        loop {
            // Register for checkin notifications before inspecting the queue; a checkin that
            // lands between the inspection and the wait would otherwise be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.paused.load(Ordering::SeqCst) {
                let cause = self.inner.clear_cause.lock().expect("lock poisoned").clone();
                return Err(match cause {
                    Some(cause) => Error::pool_cleared_error(&self.inner.address, &cause),
                    None => Error::pool_cleared_error(
                        &self.inner.address,
                        &Error::internal("server is not yet known to be available"),
                    ),
                });
            }

            // Most recently used first, discarding stale and idle connections along the way.
            {
                let mut available = self.inner.available.lock().await;
                while let Some(conn) = available.pop_back() {
                    if self.connection_is_stale(&conn) {
                        drop(available);
                        self.close_connection(conn, ConnectionClosedReason::Stale).await;
                        available = self.inner.available.lock().await;
                        continue;
                    }

                    if conn.is_idle(self.inner.max_idle_time) {
                        drop(available);
                        self.close_connection(conn, ConnectionClosedReason::Idle).await;
                        available = self.inner.available.lock().await;
                        continue;
                    }

                    return Ok(conn);
                }
            }

            if self.inner.total_connection_count.load(Ordering::SeqCst) < self.inner.max_pool_size {
                return self.create_connection().await;
            }

            // At capacity: wait for a checkin.
            match deadline {
                Some(deadline) => {
                    runtime::timeout_at(deadline, notified).await?;
                }
                None => notified.await,
            }
        }
    }

    async fn create_connection(&self) -> Result<Connection> {
        self.inner
            .total_connection_count
            .fetch_add(1, Ordering::SeqCst);

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.generation();

        self.emit_event(|handler| {
            handler.handle_connection_created_event(ConnectionCreatedEvent {
                address: self.inner.address.clone(),
                connection_id: id,
            });
        });

        let result = self
            .inner
            .establisher
            .establish_connection(self.inner.address.clone(), id, generation)
            .await;

        match result {
            Ok(mut conn) => {
                if let Some(service_id) = conn.service_id {
                    conn.generation = self.service_generation(service_id);
                }
                self.emit_event(|handler| {
                    handler.handle_connection_ready_event(ConnectionReadyEvent {
                        address: self.inner.address.clone(),
                        connection_id: conn.id,
                    });
                });
                Ok(conn)
            }
            Err(err) => {
                self.inner
                    .total_connection_count
                    .fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Checks a connection back into the pool, closing it instead if it errored or belongs to a
    /// previous generation.
    pub(crate) async fn check_in(&self, mut conn: Connection) {
        self.emit_event(|handler| {
            handler.handle_connection_checked_in_event(ConnectionCheckedInEvent {
                address: self.inner.address.clone(),
                connection_id: conn.id,
            });
        });

        if conn.error {
            self.close_connection(conn, ConnectionClosedReason::Error).await;
            return;
        }

        if self.connection_is_stale(&conn) {
            self.close_connection(conn, ConnectionClosedReason::Stale).await;
            return;
        }

        conn.mark_as_ready_and_available();
        self.inner.available.lock().await.push_back(conn);
        self.inner.notify.notify_waiters();
    }

    fn connection_is_stale(&self, conn: &Connection) -> bool {
        match conn.service_id {
            Some(service_id) => conn.is_stale(self.service_generation(service_id)),
            None => conn.is_stale(self.generation()),
        }
    }

    fn service_generation(&self, service_id: ObjectId) -> u32 {
        *self
            .inner
            .service_generations
            .lock()
            .expect("lock poisoned")
            .entry(service_id)
            .or_insert(0)
    }

    /// Increments the pool's generation (scoped to `service_id` in load-balanced mode), marking
    /// all outstanding connections stale, and pauses the pool until the server is re-confirmed.
    pub(crate) fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        match service_id {
            Some(service_id) => {
                *self
                    .inner
                    .service_generations
                    .lock()
                    .expect("lock poisoned")
                    .entry(service_id)
                    .or_insert(0) += 1;
            }
            None => {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                if !self.inner.load_balanced {
                    self.inner.paused.store(true, Ordering::SeqCst);
                }
            }
        }

        *self.inner.clear_cause.lock().expect("lock poisoned") = Some(cause);

        self.emit_event(|handler| {
            handler.handle_pool_cleared_event(PoolClearedEvent {
                address: self.inner.address.clone(),
                service_id,
            });
        });

        // Wake blocked checkouts so they fail fast instead of waiting out their deadline.
        self.inner.notify.notify_waiters();
    }

    /// Un-pauses the pool after the server has been confirmed alive.
    pub(crate) fn mark_as_ready(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            *self.inner.clear_cause.lock().expect("lock poisoned") = None;
            self.emit_event(|handler| {
                handler.handle_pool_ready_event(PoolReadyEvent {
                    address: self.inner.address.clone(),
                });
            });
            self.inner.notify.notify_waiters();
        }
    }

    async fn close_connection(&self, conn: Connection, reason: ConnectionClosedReason) {
        self.emit_event(|handler| {
            handler.handle_connection_closed_event(ConnectionClosedEvent {
                address: self.inner.address.clone(),
                connection_id: conn.id,
                reason,
            });
        });

        self.inner
            .total_connection_count
            .fetch_sub(1, Ordering::SeqCst);

        conn.close().await;
        self.inner.notify.notify_waiters();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(ref handler) = self.event_handler {
            handler.handle_pool_closed_event(PoolClosedEvent {
                address: self.address.clone(),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::options::ClientOptions;

    fn test_pool() -> ConnectionPool {
        let address = ServerAddress::parse("127.0.0.1:27017").unwrap();
        let options = ClientOptions::builder()
            .hosts(vec![address.clone()])
            .server_selection_timeout(Duration::from_millis(50))
            .build();
        let establisher = establish::ConnectionEstablisher::new(&options).unwrap();
        ConnectionPool::new(
            address,
            establisher,
            None,
            options::ConnectionPoolOptions::from_client_options(&options),
        )
    }

    #[tokio::test]
    async fn new_pool_is_paused_until_server_confirmed() {
        let pool = test_pool();

        // The server hasn't been seen by monitoring yet, so checkouts fail fast rather than
        // dialing a server that may not exist.
        let err = pool.check_out().await.unwrap_err();
        assert!(err.is_pool_cleared(), "{:?}", err);

        pool.mark_as_ready();
        pool.clear(Error::network_timeout(), None);
        let err = pool.check_out().await.unwrap_err();
        assert!(err.is_pool_cleared(), "{:?}", err);
    }

    #[tokio::test]
    async fn clear_increments_generation() {
        let pool = test_pool();
        assert_eq!(pool.generation(), 0);

        pool.clear(Error::network_timeout(), None);
        assert_eq!(pool.generation(), 1);

        pool.clear(Error::network_timeout(), None);
        assert_eq!(pool.generation(), 2);
    }

    #[tokio::test]
    async fn service_scoped_clear_leaves_global_generation() {
        let pool = test_pool();
        let service_id = ObjectId::new();

        pool.clear(Error::network_timeout(), Some(service_id));
        assert_eq!(pool.generation(), 0);
        assert_eq!(pool.service_generation(service_id), 1);

        // An unrelated service starts from its own zero.
        assert_eq!(pool.service_generation(ObjectId::new()), 0);
    }
}

/// Periodically evicts stale and idle connections and keeps the pool populated up to
/// `min_pool_size`. Runs until the pool is dropped.
fn start_maintenance_task(pool: Weak<PoolInner>) {
    runtime::spawn(async move {
        loop {
            runtime::delay_for(MAINTENANCE_FREQUENCY).await;

            let inner = match pool.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let pool = ConnectionPool { inner };

            pool.perform_maintenance().await;

            // Drop our strong reference before sleeping so shutdown isn't delayed.
        }
    });
}

impl ConnectionPool {
    async fn perform_maintenance(&self) {
        // Evict without holding the lock across closes.
        let mut to_close = Vec::new();
        {
            let mut available = self.inner.available.lock().await;
            let mut kept = VecDeque::with_capacity(available.len());
            while let Some(conn) = available.pop_front() {
                if self.connection_is_stale(&conn) || conn.is_idle(self.inner.max_idle_time) {
                    to_close.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            *available = kept;
        }
        for conn in to_close {
            let reason = if self.connection_is_stale(&conn) {
                ConnectionClosedReason::Stale
            } else {
                ConnectionClosedReason::Idle
            };
            self.close_connection(conn, reason).await;
        }

        if self.inner.paused.load(Ordering::SeqCst) {
            return;
        }

        while self.inner.total_connection_count.load(Ordering::SeqCst) < self.inner.min_pool_size {
            match self.create_connection().await {
                Ok(conn) => {
                    let mut conn = conn;
                    conn.mark_as_ready_and_available();
                    self.inner.available.lock().await.push_back(conn);
                    self.inner.notify.notify_waiters();
                }
                Err(err) => {
                    tracing::debug!(
                        address = %self.inner.address,
                        error = %err,
                        "failed to populate pool to its minimum size"
                    );
                    return;
                }
            }
        }
    }
}
