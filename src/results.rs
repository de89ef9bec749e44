//! Contains the types of results returned by driver operations.

use std::collections::VecDeque;

use crate::bson::Document;

/// The result of an `insert` command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The number of documents the server reports it inserted.
    pub inserted_count: u64,
}

/// The batch delivered by one `getMore` round trip.
#[derive(Debug, Clone)]
pub(crate) struct GetMoreResult {
    /// The documents in the batch.
    pub(crate) batch: VecDeque<Document>,

    /// Whether the cursor is closed on the server (its id came back as zero).
    pub(crate) exhausted: bool,

    /// The cursor id reported with this batch.
    pub(crate) id: i64,
}
