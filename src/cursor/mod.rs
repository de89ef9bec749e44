use std::{
    collections::VecDeque,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{Future, Stream};
use serde::de::DeserializeOwned;

use crate::{
    bson::Document,
    counters,
    error::Result,
    namespace::Namespace,
    operation::{CursorInfo, GetMore, KillCursors},
    options::ServerAddress,
    results::GetMoreResult,
    runtime, BoxFuture, Client,
};

/// Specification used to create a new cursor, produced from the reply to a cursor-producing
/// command.
#[derive(Debug, Clone)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<Document>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: CursorInfo,
        address: ServerAddress,
        batch_size: impl Into<Option<u32>>,
        max_time: impl Into<Option<Duration>>,
    ) -> Self {
        Self {
            info: CursorInformation {
                ns: info.ns,
                id: info.id,
                address,
                generation: 0,
                batch_size: batch_size.into(),
                max_time: max_time.into(),
                lsid: None,
            },
            initial_buffer: info.first_batch,
        }
    }

    pub(crate) fn id(&self) -> i64 {
        self.info.id
    }
}

/// The immutable facts a cursor needs to run getMores: where it lives, which pool generation it
/// was created under, and which session it belongs to.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
    pub(crate) max_time: Option<Duration>,
    pub(crate) lsid: Option<Document>,
}

/// A cursor streaming the results of a query from the server in batches.
///
/// `Cursor` implements [`futures::Stream`](https://docs.rs/futures/latest/futures/stream/index.html),
/// so results are read by iterating asynchronously:
///
/// ```rust,no_run
/// # use futures_util::TryStreamExt;
/// # use mongodb_core::{bson::{doc, Document}, error::Result, Client};
/// # async fn run(client: Client) -> Result<()> {
/// let mut cursor = client
///     .run_cursor_command("db", doc! { "find": "coll", "filter": { "x": 1 } })
///     .await?;
/// while let Some(doc) = cursor.try_next().await? {
///     println!("{}", doc);
/// }
/// # Ok(())
/// # }
/// ```
///
/// Each batch is fetched with a `getMore` pinned to the server (and connection-pool generation)
/// that created the cursor. A tailable await cursor stays live across empty batches; awaiting
/// its next item simply waits until the server has more to deliver.
///
/// Dropping a non-exhausted cursor schedules a best-effort `killCursors` for its server-side
/// state.
pub struct Cursor<T = Document>
where
    T: DeserializeOwned,
{
    client: Client,
    info: CursorInformation,
    buffer: VecDeque<Document>,
    exhausted: bool,

    /// Set when the pinned connection state is no longer trustworthy (network error or stale
    /// generation); the server-side cursor is presumed dead, so no killCursors is sent.
    invalidated: bool,

    #[allow(clippy::type_complexity)]
    pending: Option<BoxFuture<'static, Result<GetMoreResult>>>,

    _phantom: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("info", &self.info)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl<T: DeserializeOwned> Cursor<T> {
    pub(crate) fn new(client: Client, spec: CursorSpecification) -> Self {
        let exhausted = spec.id() == 0;
        if !exhausted {
            counters::incr(&counters::CURSORS_ACTIVE);
        }
        Self {
            client,
            info: spec.info,
            buffer: spec.initial_buffer,
            exhausted,
            invalidated: false,
            pending: None,
            _phantom: PhantomData,
        }
    }

    /// The id of the server-side cursor, or 0 if it is exhausted.
    pub fn id(&self) -> i64 {
        self.info.id
    }

    /// The namespace the cursor reads from.
    pub fn namespace(&self) -> &Namespace {
        &self.info.ns
    }

    /// The address of the server this cursor is pinned to.
    pub fn address(&self) -> &ServerAddress {
        &self.info.address
    }

    /// Whether the server has reported the end of the result set and the local buffer is empty.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    fn start_get_more(&mut self) {
        let op = GetMore::new(self.info.clone());
        let client = self.client.clone();
        self.pending = Some(Box::pin(async move {
            client.execute_operation(op, None).await
        }));
    }

    fn handle_get_more(&mut self, result: Result<GetMoreResult>) -> Result<()> {
        match result {
            Ok(get_more) => {
                self.exhausted = get_more.exhausted;
                self.info.id = get_more.id;
                self.buffer = get_more.batch;
                if self.exhausted {
                    self.dispose();
                }
                Ok(())
            }
            Err(error) => {
                if error.is_network_error() {
                    // The connection died mid-conversation; the server will reap the cursor
                    // itself, and killCursors over a fresh connection could hit the wrong state.
                    self.invalidated = true;
                    self.dispose();
                } else if matches!(error.sdam_code(), Some(43) | Some(237)) {
                    // CursorNotFound or CursorKilled: the server already forgot this cursor.
                    self.exhausted = true;
                    self.invalidated = true;
                    self.dispose();
                }
                Err(error)
            }
        }
    }

    fn dispose(&mut self) {
        counters::incr(&counters::CURSORS_DISPOSED);
        counters::decr(&counters::CURSORS_ACTIVE);
    }
}

impl<T: DeserializeOwned> Stream for Cursor<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            // If there is a getMore in flight, check on its status.
            if let Some(future) = self.pending.as_mut() {
                match Pin::new(future).poll(cx) {
                    Poll::Ready(result) => {
                        self.pending = None;
                        if let Err(error) = self.handle_get_more(result) {
                            return Poll::Ready(Some(Err(error)));
                        }
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            match self.buffer.pop_front() {
                Some(doc) => {
                    let item = crate::bson::from_document(doc).map_err(crate::error::Error::from);
                    return Poll::Ready(Some(item));
                }
                None if !self.exhausted && !self.invalidated => {
                    // An empty batch with a live cursor id (e.g. a tailable cursor between
                    // writes) loops straight into the next getMore.
                    self.start_get_more();
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<T: DeserializeOwned> Drop for Cursor<T> {
    fn drop(&mut self) {
        if self.exhausted || self.invalidated || self.info.id == 0 {
            return;
        }

        self.dispose();

        // Fire-and-forget: failure to kill just leaves the cursor to the server's timeout.
        let op = KillCursors::new(
            self.info.ns.clone(),
            vec![self.info.id],
            self.info.address.clone(),
        );
        let client = self.client.clone();
        runtime::spawn(async move {
            let _ = client.execute_operation(op, None).await;
        });
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{bson::doc, options::ClientOptions};

    #[test]
    fn spec_with_zero_id_is_born_exhausted() {
        let info = CursorInfo {
            id: 0,
            ns: Namespace::new("db", "coll"),
            first_batch: vec![doc! { "x": 1 }].into(),
        };
        let spec = CursorSpecification::new(info, ServerAddress::default(), None, None);
        assert_eq!(spec.id(), 0);
        assert_eq!(spec.initial_buffer.len(), 1);
    }

    fn disconnected_client() -> Client {
        Client::with_options(
            ClientOptions::builder()
                .hosts(vec![ServerAddress::parse("127.0.0.1:2").unwrap()])
                .connect_timeout(Duration::from_millis(50))
                .server_selection_timeout(Duration::from_millis(50))
                .build(),
        )
        .unwrap()
    }

    fn live_cursor(client: &Client) -> Cursor {
        let info = CursorInfo {
            id: 7,
            ns: Namespace::new("db", "coll"),
            first_batch: vec![doc! { "x": 1 }].into(),
        };
        let mut spec = CursorSpecification::new(info, ServerAddress::default(), None, None);
        spec.info.generation = 1;
        Cursor::new(client.clone(), spec)
    }

    #[tokio::test]
    async fn get_more_replies_drive_the_state_machine() {
        let client = disconnected_client();
        let mut cursor = live_cursor(&client);

        assert_eq!(cursor.id(), 7);
        assert!(!cursor.is_exhausted());

        // A live reply refreshes the buffer and keeps the cursor open.
        cursor
            .handle_get_more(Ok(GetMoreResult {
                batch: vec![doc! { "x": 2 }].into(),
                exhausted: false,
                id: 7,
            }))
            .unwrap();
        assert_eq!(cursor.id(), 7);
        assert!(!cursor.is_exhausted());

        // A zero cursor id exhausts the cursor even while its batch is still buffered, so a
        // subsequent drop has nothing to kill.
        cursor
            .handle_get_more(Ok(GetMoreResult {
                batch: vec![doc! { "x": 3 }].into(),
                exhausted: true,
                id: 0,
            }))
            .unwrap();
        assert!(cursor.exhausted);
        assert_eq!(cursor.buffer.len(), 1);
        assert!(!cursor.is_exhausted(), "buffered documents remain readable");

        drop(cursor);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn network_errors_invalidate_the_cursor() {
        let client = disconnected_client();
        let mut cursor = live_cursor(&client);

        let err = cursor
            .handle_get_more(Err(crate::error::Error::network_timeout()))
            .unwrap_err();
        assert!(err.is_network_error());
        assert!(cursor.invalidated);

        // No killCursors should be scheduled for an invalidated cursor.
        drop(cursor);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn cursor_not_found_counts_as_exhausted() {
        let client = disconnected_client();
        let mut cursor = live_cursor(&client);

        let stale = crate::error::Error::stale_cursor(&ServerAddress::default());
        let err = cursor.handle_get_more(Err(stale)).unwrap_err();
        assert_eq!(err.sdam_code(), Some(43));
        assert!(cursor.exhausted);

        drop(cursor);
        client.shutdown().await;
    }
}
