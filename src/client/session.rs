//! Lightweight logical sessions: client-generated session ids, transaction numbers for
//! retryable writes, and causal-consistency cluster time gossip.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::bson::{doc, spec::BinarySubtype, Binary, Document, Timestamp};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    /// The timestamp component, which totally orders cluster times.
    pub(crate) cluster_time: Timestamp,

    /// The server's signature over the timestamp. Carried opaquely; only the server validates
    /// it.
    pub(crate) signature: Document,
}

impl ClusterTime {
    /// The timestamp component of this cluster time.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }

    #[cfg(test)]
    pub(crate) fn new_testing(time: u32, increment: u32) -> Self {
        Self {
            cluster_time: Timestamp { time, increment },
            signature: doc! {},
        }
    }
}

impl std::cmp::PartialEq for ClusterTime {
    fn eq(&self, other: &ClusterTime) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl std::cmp::Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A MongoDB client session. Sessions are created client-side (the id is a driver-generated
/// UUID); the server materializes them lazily on first use.
#[derive(Clone, Debug)]
pub struct ClientSession {
    id: Document,
    txn_number: i64,
    cluster_time: Option<ClusterTime>,
}

impl ClientSession {
    pub(crate) fn new() -> Self {
        let mut uuid_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid_bytes);
        // Set the RFC 4122 version (4) and variant bits.
        uuid_bytes[6] = (uuid_bytes[6] & 0x0f) | 0x40;
        uuid_bytes[8] = (uuid_bytes[8] & 0x3f) | 0x80;

        Self {
            id: doc! {
                "id": Binary {
                    subtype: BinarySubtype::Uuid,
                    bytes: uuid_bytes.to_vec(),
                },
            },
            txn_number: 0,
            cluster_time: None,
        }
    }

    /// The id of this session, sent as the `lsid` field of commands.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// The highest cluster time this session has observed.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Advances this session's cluster time, if the given one is newer.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Allocates the transaction number for a new retryable write, so a retry can reuse it and
    /// the server can de-duplicate.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        self.txn_number += 1;
        self.txn_number
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cluster_time_orders_by_timestamp() {
        let early = ClusterTime::new_testing(1, 1);
        let later_increment = ClusterTime::new_testing(1, 2);
        let later_time = ClusterTime::new_testing(2, 1);

        assert!(early < later_increment);
        assert!(later_increment < later_time);
        assert_eq!(early, ClusterTime::new_testing(1, 1));
    }

    #[test]
    fn session_cluster_time_is_monotone() {
        let mut session = ClientSession::new();
        assert!(session.cluster_time().is_none());

        session.advance_cluster_time(&ClusterTime::new_testing(2, 1));
        session.advance_cluster_time(&ClusterTime::new_testing(1, 5));
        assert_eq!(session.cluster_time(), Some(&ClusterTime::new_testing(2, 1)));
    }

    #[test]
    fn session_ids_are_distinct_uuids() {
        let a = ClientSession::new();
        let b = ClientSession::new();
        assert_ne!(a.id(), b.id());

        let binary = match a.id().get("id") {
            Some(crate::bson::Bson::Binary(binary)) => binary,
            other => panic!("expected binary session id, got {:?}", other),
        };
        assert_eq!(binary.subtype, BinarySubtype::Uuid);
        assert_eq!(binary.bytes.len(), 16);
        assert_eq!(binary.bytes[6] >> 4, 4);
    }

    #[test]
    fn txn_numbers_increment() {
        let mut session = ClientSession::new();
        assert_eq!(session.get_and_increment_txn_number(), 1);
        assert_eq!(session.get_and_increment_txn_number(), 2);
    }
}
