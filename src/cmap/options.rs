use std::time::Duration;

use crate::options::ClientOptions;

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// The subset of client options a connection pool needs.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionPoolOptions {
    pub(crate) max_pool_size: Option<u32>,
    pub(crate) min_pool_size: Option<u32>,
    pub(crate) max_idle_time: Option<Duration>,
    pub(crate) load_balanced: Option<bool>,

    /// How long a checkout may block waiting for a checkin before failing. Derived from the
    /// server selection timeout, since that is the user's stated patience for acquiring a
    /// server.
    pub(crate) wait_queue_timeout: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_idle_time: options.max_idle_time,
            load_balanced: options.load_balanced,
            wait_queue_timeout: options.server_selection_timeout,
        }
    }
}
