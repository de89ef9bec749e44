pub(crate) mod command;
pub(crate) mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufStream};

use crate::{
    bson::oid::ObjectId,
    compression::{command_supports_compression, compressors::Compressor},
    counters,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::{self, AsyncStream, TlsConfig},
};

pub(crate) use self::{
    command::{Command, RawCommandResponse},
    stream_description::StreamDescription,
};
use self::wire::{Message, DEFAULT_MAX_MESSAGE_SIZE_BYTES};

/// User-facing information about a connection to the database.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection. Note that this is
    /// not the same as the server-side `connectionId`.
    pub id: u32,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// An owned, single-user byte channel to one server. Requests and replies are strictly FIFO on a
/// connection; correlation via `responseTo` is validated, never used for reordering.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,

    /// The pool generation this connection was created under. Checked against the pool's current
    /// generation on checkin; stale connections are closed instead of reused.
    pub(crate) generation: u32,

    /// The service behind a load balancer this connection is bound to, from the handshake reply.
    pub(crate) service_id: Option<ObjectId>,

    stream: BufStream<AsyncStream>,

    /// The handshake view of the server. `None` only before the handshake has completed.
    pub(crate) stream_description: Option<StreamDescription>,

    /// The compressor negotiated during the handshake, if any.
    pub(crate) compressor: Option<Compressor>,

    /// The per-operation read/write deadline. Zero or `None` means no deadline.
    socket_timeout: Option<Duration>,

    /// When the connection was last returned to the pool, for idleness accounting.
    ready_and_available_time: Option<Instant>,

    /// Set when an error occurs on the stream; the connection is then never reused.
    pub(crate) error: bool,
}

impl Connection {
    /// Opens a new connection (TCP, optionally TLS) to the given address. The returned connection
    /// has not been handshaked yet.
    pub(crate) async fn connect(
        id: u32,
        address: ServerAddress,
        generation: u32,
        connect_timeout: Option<Duration>,
        socket_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(&address, connect_timeout, tls_config).await?;

        Ok(Self {
            id,
            address,
            generation,
            service_id: None,
            stream: BufStream::new(stream),
            stream_description: None,
            compressor: None,
            socket_timeout,
            ready_and_available_time: None,
            error: false,
        })
    }

    /// Opens a connection for monitoring use. Monitoring connections are never pooled, so the
    /// generation is pinned to zero.
    pub(crate) async fn connect_monitoring(
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        Self::connect(0, address, 0, connect_timeout, connect_timeout, tls_config).await
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "connection used before handshake completed".to_string(),
            }
            .into()
        })
    }

    fn max_message_size_bytes(&self) -> i32 {
        self.stream_description
            .as_ref()
            .map(|sd| sd.max_message_size_bytes)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES)
    }

    /// Sends a command over the wire and reads its reply. Any stream failure marks the connection
    /// as broken; the pool will close it on checkin.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        let result = self
            .send_command_inner(command, request_id.into())
            .await;

        if let Err(ref err) = result {
            if err.is_network_error() {
                self.error = true;
                if err.is_network_timeout() {
                    counters::incr(&counters::STREAMS_TIMEOUT);
                }
            }
        }

        result
    }

    async fn send_command_inner(
        &mut self,
        command: Command,
        request_id: Option<i32>,
    ) -> Result<RawCommandResponse> {
        let deadline = self
            .socket_timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        let max_message_size = self.max_message_size_bytes();

        let compressor = self
            .compressor
            .as_ref()
            .filter(|_| command_supports_compression(&command.name))
            .cloned();

        let message = Message::from_command(command, request_id);

        let sent_request_id = match (&compressor, deadline) {
            (Some(compressor), Some(deadline)) => {
                runtime::timeout_at(
                    deadline,
                    message.write_op_compressed_to(&mut self.stream, compressor, max_message_size),
                )
                .await??
            }
            (Some(compressor), None) => {
                message
                    .write_op_compressed_to(&mut self.stream, compressor, max_message_size)
                    .await?
            }
            (None, Some(deadline)) => {
                runtime::timeout_at(deadline, message.write_to(&mut self.stream, max_message_size))
                    .await??
            }
            (None, None) => message.write_to(&mut self.stream, max_message_size).await?,
        };

        let reply = match deadline {
            Some(deadline) => {
                runtime::timeout_at(deadline, Message::read_from(&mut self.stream, max_message_size))
                    .await??
            }
            None => Message::read_from(&mut self.stream, max_message_size).await?,
        };

        if reply.response_to != sent_request_id {
            return Err(Error::invalid_response(format!(
                "expected a response to request {} but got one to {}",
                sent_request_id, reply.response_to
            )));
        }

        let document = reply.single_document_response()?;
        RawCommandResponse::new(self.address.clone(), &document)
    }

    /// Whether the connection belongs to a previous pool generation and must be closed.
    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    /// Whether the connection has sat idle in the pool for longer than `max_idle_time`.
    pub(crate) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (max_idle_time, self.ready_and_available_time) {
            (Some(max), Some(ready)) if !max.is_zero() => ready.elapsed() >= max,
            _ => false,
        }
    }

    pub(crate) fn mark_as_ready_and_available(&mut self) {
        self.ready_and_available_time = Some(Instant::now());
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.ready_and_available_time = None;
    }

    /// Shuts the stream down, ignoring failures; dropping would also release the socket, this
    /// just does so promptly.
    pub(crate) async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
