use std::{
    sync::atomic::{AtomicI32, Ordering},
    time::Instant,
};

use crate::{
    bson::{doc, Document},
    client::session::ClientSession,
    cmap::{Connection, RawCommandResponse},
    cursor::Cursor,
    error::{Error, Result, RETRYABLE_WRITE_ERROR},
    event::command::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
    operation::{Operation, Retryability},
    options::ServerAddress,
    sdam::HandshakePhase,
    selection_criteria::{ReadPreference, SelectionCriteria},
    Client,
};

/// Ties together the command events of one logical operation across retries and batches.
fn next_operation_id() -> i32 {
    static OPERATION_ID: AtomicI32 = AtomicI32::new(0);
    OPERATION_ID.fetch_add(1, Ordering::SeqCst)
}

/// The output of an operation execution along with the connection state a cursor needs to pin
/// itself.
pub(crate) struct ExecutionDetails<O> {
    pub(crate) output: O,
    pub(crate) generation: u32,
    pub(crate) lsid: Option<Document>,
}

impl Client {
    /// Executes an operation: select a server, check out a connection, dispatch, classify, and
    /// transparently retry once when the error and the operation both allow it.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        mut op: T,
        session: Option<&mut ClientSession>,
    ) -> Result<T::O> {
        self.execute_operation_with_details(&mut op, session)
            .await
            .map(|details| details.output)
    }

    /// Executes a cursor-producing operation and wraps its result in a `Cursor` pinned to the
    /// executing server and pool generation.
    pub(crate) async fn execute_cursor_operation<T>(
        &self,
        mut op: T,
        session: Option<&mut ClientSession>,
    ) -> Result<Cursor>
    where
        T: Operation<O = crate::cursor::CursorSpecification>,
    {
        let details = self.execute_operation_with_details(&mut op, session).await?;

        let mut spec = details.output;
        spec.info.generation = details.generation;
        spec.info.lsid = details.lsid;

        Ok(Cursor::new(self.clone(), spec))
    }

    pub(crate) async fn execute_operation_with_details<T: Operation>(
        &self,
        op: &mut T,
        session: Option<&mut ClientSession>,
    ) -> Result<ExecutionDetails<T::O>> {
        let operation_id = next_operation_id();

        // Sessions are created client-side, so operations without an explicit one get a cheap
        // implicit session to carry their lsid and transaction numbers.
        let mut implicit_session = ClientSession::new();
        let session: &mut ClientSession = match session {
            Some(session) => session,
            None => &mut implicit_session,
        };

        let criteria = op
            .selection_criteria()
            .cloned()
            .or_else(|| self.options().selection_criteria.clone())
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));

        let mut retrying = false;
        let mut prior_txn_number: Option<i64> = None;
        let mut deprioritized: Option<ServerAddress> = None;

        loop {
            let server = self
                .topology()
                .select_server(&criteria, op.name(), deprioritized.as_ref())
                .await?;

            let mut conn = match server.pool.check_out().await {
                Ok(conn) => conn,
                Err(err) => {
                    self.topology()
                        .updater()
                        .handle_application_error(
                            server.address.clone(),
                            err.clone(),
                            HandshakePhase::BeforeCompletion {
                                generation: server.pool.generation(),
                            },
                        )
                        .await;

                    // A cleared pool or connection establishment failure is retryable by
                    // selecting a different server, once.
                    let retry_enabled = match op.retryability() {
                        Retryability::Read => self.options().retry_reads != Some(false),
                        Retryability::Write => self.options().retry_writes != Some(false),
                        Retryability::None => false,
                    };
                    if retrying || !retry_enabled {
                        return Err(err);
                    }
                    retrying = true;
                    deprioritized = Some(server.address.clone());
                    continue;
                }
            };

            // Cursor-pinned operations must observe the same pool generation their cursor was
            // created under; a newer generation means the server state is gone.
            if let Some(pinned_generation) = op.pinned_generation() {
                if conn.generation != pinned_generation {
                    server.pool.check_in(conn).await;
                    return Err(Error::stale_cursor(&server.address));
                }
            }

            let retryability = self.effective_retryability(&conn, &*op)?;

            let txn_number = match retryability {
                Retryability::Write => Some(
                    prior_txn_number.unwrap_or_else(|| session.get_and_increment_txn_number()),
                ),
                _ => None,
            };

            let details_generation = conn.generation;
            let supports_sessions = conn
                .stream_description()
                .map(|sd| sd.logical_session_timeout.is_some())
                .unwrap_or(false);
            let result = self
                .execute_operation_on_connection(
                    op,
                    &mut conn,
                    session,
                    txn_number,
                    &criteria,
                    operation_id,
                )
                .await;

            match result {
                Ok(output) => {
                    let lsid = supports_sessions.then(|| session.id().clone());
                    server.pool.check_in(conn).await;
                    return Ok(ExecutionDetails {
                        output,
                        generation: details_generation,
                        lsid,
                    });
                }
                Err(mut err) => {
                    let max_wire_version = conn
                        .stream_description()
                        .ok()
                        .and_then(|sd| sd.max_wire_version)
                        .unwrap_or(0);
                    err.wire_version = Some(max_wire_version);

                    if retryability == Retryability::Write
                        && err.should_add_retryable_write_label(max_wire_version)
                    {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }

                    let phase = HandshakePhase::AfterCompletion {
                        generation: conn.generation,
                        max_wire_version,
                    };

                    server.pool.check_in(conn).await;

                    self.topology()
                        .updater()
                        .handle_application_error(server.address.clone(), err.clone(), phase)
                        .await;

                    if retrying {
                        return Err(err);
                    }

                    let will_retry = match retryability {
                        Retryability::Read => {
                            self.options().retry_reads != Some(false) && err.is_read_retryable()
                        }
                        Retryability::Write => {
                            self.options().retry_writes != Some(false) && err.is_write_retryable()
                        }
                        Retryability::None => false,
                    };

                    if !will_retry {
                        return Err(err);
                    }

                    // At most one retry per command: the next failure propagates.
                    retrying = true;
                    prior_txn_number = txn_number;
                    deprioritized = Some(server.address.clone());
                    op.update_for_retry();
                }
            }
        }
    }

    /// The retryability of this execution attempt: the operation's inherent level, downgraded
    /// when the server the connection is talking to can't support it.
    fn effective_retryability<T: Operation>(
        &self,
        conn: &Connection,
        op: &T,
    ) -> Result<Retryability> {
        match op.retryability() {
            Retryability::Write => {
                if op.is_acknowledged() && conn.stream_description()?.supports_retryable_writes() {
                    Ok(Retryability::Write)
                } else {
                    Ok(Retryability::None)
                }
            }
            other => Ok(other),
        }
    }

    async fn execute_operation_on_connection<T: Operation>(
        &self,
        op: &mut T,
        conn: &mut Connection,
        session: &mut ClientSession,
        txn_number: Option<i64>,
        criteria: &SelectionCriteria,
        operation_id: i32,
    ) -> Result<T::O> {
        let stream_description = conn.stream_description()?.clone();

        let mut cmd = op.build(&stream_description)?;

        // Attach the read preference the target server needs to see, if any.
        let read_pref = criteria
            .as_read_pref()
            .cloned()
            .unwrap_or(ReadPreference::Primary);
        if let Some(resolved) = self
            .topology()
            .watcher()
            .peek_latest()
            .description
            .resolve_read_preference_for_command(&conn.address, &read_pref)
        {
            cmd.set_read_preference(resolved);
        }

        // Sessions require server support; a server without logical sessions just doesn't get
        // an lsid.
        if stream_description.logical_session_timeout.is_some()
            && !cmd.body.contains_key("lsid")
        {
            cmd.set_session_id(session.id());
        }

        if let Some(txn_number) = txn_number {
            cmd.set_txn_number(txn_number);
        }

        // Gossip the highest cluster time this client or session has seen.
        let cluster_time = match (self.topology().cluster_time(), session.cluster_time()) {
            (Some(a), Some(b)) => Some(std::cmp::max(a, b.clone())),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        if let Some(ref cluster_time) = cluster_time {
            cmd.set_cluster_time(cluster_time);
        }

        let connection_info = conn.info();
        let should_redact = cmd.should_redact();
        let request_id = crate::cmap::conn::wire::util::next_request_id();

        self.emit_command_started(&cmd, request_id, operation_id, &connection_info, should_redact);

        let start = Instant::now();
        let response_result = conn.send_command(cmd.clone(), request_id).await;
        let duration = start.elapsed();

        let response = match response_result {
            Ok(response) => response,
            Err(err) => {
                self.emit_command_failed(
                    &cmd.name,
                    &err,
                    duration,
                    request_id,
                    operation_id,
                    &connection_info,
                    should_redact,
                );
                return Err(err);
            }
        };

        // Cluster time advances monotonically even from error replies.
        if let Some(reply_cluster_time) = response.cluster_time() {
            self.topology()
                .advance_cluster_time(reply_cluster_time.clone())
                .await;
            session.advance_cluster_time(&reply_cluster_time);
        }

        if let Some(err) = self.command_error_of(&response) {
            self.emit_command_failed(
                &cmd.name,
                &err,
                duration,
                request_id,
                operation_id,
                &connection_info,
                should_redact,
            );
            return Err(err);
        }

        self.emit_command_succeeded(
            &cmd.name,
            &response,
            duration,
            request_id,
            operation_id,
            &connection_info,
            should_redact,
        );

        op.handle_response(response, &stream_description)
    }

    /// Extracts a top-level command error (`ok: 0`) from a reply, if present.
    fn command_error_of(&self, response: &RawCommandResponse) -> Option<Error> {
        match response.ok_or_command_error() {
            Err(err) if err.is_command_error() => Some(err),
            _ => None,
        }
    }

    fn emit_command_started(
        &self,
        cmd: &crate::cmap::Command,
        request_id: i32,
        operation_id: i32,
        connection: &crate::cmap::ConnectionInfo,
        should_redact: bool,
    ) {
        if let Some(ref handler) = self.options().command_event_handler {
            let command = if should_redact {
                doc! {}
            } else {
                cmd.body.clone()
            };
            handler.handle_command_started_event(CommandStartedEvent {
                command,
                db: cmd.target_db.clone(),
                command_name: cmd.name.clone(),
                request_id,
                operation_id,
                connection: connection.clone(),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_command_succeeded(
        &self,
        command_name: &str,
        response: &RawCommandResponse,
        duration: std::time::Duration,
        request_id: i32,
        operation_id: i32,
        connection: &crate::cmap::ConnectionInfo,
        should_redact: bool,
    ) {
        if let Some(ref handler) = self.options().command_event_handler {
            let reply = if should_redact {
                doc! {}
            } else {
                response.to_document().unwrap_or_default()
            };
            handler.handle_command_succeeded_event(CommandSucceededEvent {
                duration,
                reply,
                command_name: command_name.to_string(),
                request_id,
                operation_id,
                connection: connection.clone(),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_command_failed(
        &self,
        command_name: &str,
        error: &Error,
        duration: std::time::Duration,
        request_id: i32,
        operation_id: i32,
        connection: &crate::cmap::ConnectionInfo,
        should_redact: bool,
    ) {
        if let Some(ref handler) = self.options().command_event_handler {
            let mut failure = error.clone();
            if should_redact {
                failure.redact();
            }
            handler.handle_command_failed_event(CommandFailedEvent {
                duration,
                command_name: command_name.to_string(),
                failure,
                request_id,
                operation_id,
                connection: connection.clone(),
            });
        }
    }
}
