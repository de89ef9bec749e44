//! Process-wide driver activity counters.
//!
//! Each counter is a relaxed atomic incremented at exactly one point in the driver; together
//! they give a cheap external view of wire traffic, stream churn, and authentication outcomes
//! without requiring an event handler. Readers should treat values as monotonically increasing
//! except where a paired `*_disposed`/`*_active` counter implies a difference.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$attr:meta])* $name:ident;)+) => {
        $(
            $(#[$attr])*
            pub static $name: AtomicU64 = AtomicU64::new(0);
        )+

        /// A point-in-time snapshot of every counter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[allow(non_snake_case, missing_docs)]
        pub struct CounterSnapshot {
            $(pub $name: u64,)+
        }

        /// Reads all counters at once. The values are individually atomic but not mutually
        /// consistent.
        pub fn snapshot() -> CounterSnapshot {
            CounterSnapshot {
                $($name: $name.load(Ordering::Relaxed),)+
            }
        }
    };
}

counters! {
    /// `OP_MSG` requests written to a stream.
    OP_EGRESS_MSG;
    /// `OP_MSG` replies read from a stream.
    OP_INGRESS_MSG;
    /// `OP_COMPRESSED` requests written to a stream.
    OP_EGRESS_COMPRESSED;
    /// `OP_COMPRESSED` replies read from a stream.
    OP_INGRESS_COMPRESSED;
    /// All requests written, regardless of opcode.
    OP_EGRESS_TOTAL;
    /// All replies read, regardless of opcode.
    OP_INGRESS_TOTAL;
    /// Streams currently connected.
    STREAMS_ACTIVE;
    /// Streams closed or dropped.
    STREAMS_DISPOSED;
    /// Stream operations that failed by exceeding their deadline.
    STREAMS_TIMEOUT;
    /// Server-side cursors currently held open by `Cursor` values.
    CURSORS_ACTIVE;
    /// Cursors exhausted, killed, or dropped.
    CURSORS_DISPOSED;
    /// Clients currently alive.
    CLIENTS_ACTIVE;
    /// Clients shut down or dropped.
    CLIENTS_DISPOSED;
    /// Successful authentication conversations.
    AUTH_SUCCESS;
    /// Failed authentication conversations.
    AUTH_FAILURE;
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn decr(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let before = snapshot();
        incr(&OP_EGRESS_TOTAL);
        incr(&OP_EGRESS_TOTAL);
        let after = snapshot();
        assert!(after.OP_EGRESS_TOTAL >= before.OP_EGRESS_TOTAL + 2);
    }
}
