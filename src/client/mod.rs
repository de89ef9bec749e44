pub(crate) mod auth;
mod executor;
pub(crate) mod options;
pub(crate) mod session;

use std::{sync::Arc, time::Duration};

use crate::{
    bson::Document,
    concern::WriteConcern,
    counters,
    cursor::Cursor,
    error::{ErrorKind, Result},
    namespace::Namespace,
    operation::{
        Aggregate, Find, FindOptions, Insert, ListCollections, RunCommand, RunCursorCommand,
    },
    options::{ClientOptions, SelectionCriteria},
    results::InsertManyResult,
    sdam::Topology,
};

use self::session::ClientSession;

/// The entry point to the driver core, which handles server discovery and monitoring, server
/// selection, connection pooling, and command dispatch for one deployment.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can safely be shared across threads and
/// tasks by cloning; all clones observe the same topology and pools.
///
/// ```rust,no_run
/// # use mongodb_core::{bson::doc, error::Result, options::{ClientOptions, ServerAddress}, Client};
/// # async fn run() -> Result<()> {
/// let options = ClientOptions::builder()
///     .hosts(vec![ServerAddress::parse("localhost:27017")?])
///     .build();
/// let client = Client::with_options(options)?;
///
/// for i in 0..5 {
///     let client_ref = client.clone();
///
///     tokio::task::spawn(async move {
///         client_ref.run_command("admin", doc! { "ping": i }).await
///     });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        counters::incr(&counters::CLIENTS_DISPOSED);
        counters::decr(&counters::CLIENTS_ACTIVE);
    }
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `options`.
    ///
    /// This is a purely local operation: background monitoring starts immediately, but no
    /// network round-trips are awaited, and failures to reach the deployment surface from the
    /// first operation instead. Must be called from within a tokio runtime.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone())?,
            options,
        });

        counters::incr(&counters::CLIENTS_ACTIVE);

        Ok(Self { inner })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Starts a new [`ClientSession`], which can be threaded through operations to tie them to
    /// one logical session and to carry causal-consistency cluster times.
    pub fn start_session(&self) -> ClientSession {
        ClientSession::new()
    }

    /// Runs a database-level command against the database `db`.
    ///
    /// The command is dispatched as provided, with routing and infrastructure fields
    /// (`$db`, `$readPreference`, `lsid`, `$clusterTime`) attached by the driver. The default
    /// selection criteria route to the primary.
    pub async fn run_command(&self, db: impl AsRef<str>, command: Document) -> Result<Document> {
        let op = RunCommand::new(db.as_ref(), command, None)?;
        self.execute_operation(op, None).await
    }

    /// Runs a database-level command with explicit selection criteria.
    pub async fn run_command_with(
        &self,
        db: impl AsRef<str>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let op = RunCommand::new(db.as_ref(), command, selection_criteria.into())?;
        self.execute_operation(op, None).await
    }

    /// Runs a database-level command in the given session.
    pub async fn run_command_with_session(
        &self,
        db: impl AsRef<str>,
        command: Document,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let op = RunCommand::new(db.as_ref(), command, None)?;
        self.execute_operation(op, Some(session)).await
    }

    /// Runs a cursor-producing command (e.g. `find`, `aggregate`, `listIndexes`) and returns a
    /// [`Cursor`] over its results.
    pub async fn run_cursor_command(
        &self,
        db: impl AsRef<str>,
        command: Document,
    ) -> Result<Cursor> {
        self.run_cursor_command_with(db, command, None, None, None)
            .await
    }

    /// Runs a cursor-producing command with explicit routing and cursor tuning.
    pub async fn run_cursor_command_with(
        &self,
        db: impl AsRef<str>,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        batch_size: impl Into<Option<u32>>,
        max_time: impl Into<Option<Duration>>,
    ) -> Result<Cursor> {
        let op = RunCursorCommand::new(
            db.as_ref(),
            command,
            selection_criteria.into(),
            batch_size.into(),
            max_time.into(),
        )?;
        self.execute_cursor_operation(op, None).await
    }

    /// Runs a `find` against the given namespace, returning a [`Cursor`] over the matching
    /// documents.
    pub async fn find(
        &self,
        ns: Namespace,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor> {
        let op = Find::new(ns, filter.into(), options.into());
        self.execute_cursor_operation(op, None).await
    }

    /// Runs an aggregation pipeline against the given namespace, returning a [`Cursor`] over its
    /// results.
    pub async fn aggregate(
        &self,
        ns: Namespace,
        pipeline: impl IntoIterator<Item = Document>,
        batch_size: impl Into<Option<u32>>,
    ) -> Result<Cursor> {
        let op = Aggregate::new(ns, pipeline, batch_size.into(), None);
        self.execute_cursor_operation(op, None).await
    }

    /// Lists the collections of the database `db`, returning a [`Cursor`] over their
    /// descriptions.
    pub async fn list_collections(
        &self,
        db: impl AsRef<str>,
        filter: impl Into<Option<Document>>,
    ) -> Result<Cursor> {
        let op = ListCollections::new(db.as_ref(), filter.into(), false, None);
        self.execute_cursor_operation(op, None).await
    }

    /// Inserts the given documents into the namespace `ns`, splitting them into as many `insert`
    /// commands as the server's message size and batch count limits require. The documents ride
    /// in an `OP_MSG` document sequence.
    pub async fn insert_many(
        &self,
        ns: Namespace,
        documents: Vec<Document>,
        ordered: bool,
        write_concern: impl Into<Option<WriteConcern>>,
    ) -> Result<InsertManyResult> {
        if documents.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "insert requires at least one document".to_string(),
            }
            .into());
        }

        let mut op = Insert::new(ns, documents, ordered, write_concern.into());

        let mut inserted_count = 0;
        while !op.is_exhausted() {
            let details = self.execute_operation_with_details(&mut op, None).await?;
            inserted_count += details.output.inserted_count;
            op.advance_batch();
        }

        Ok(InsertManyResult { inserted_count })
    }

    /// Shuts down this client, ending background monitoring. Outstanding clones of the client
    /// become unusable.
    pub async fn shutdown(&self) {
        self.inner.topology.shutdown().await;
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }
}
