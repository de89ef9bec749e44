use std::time::Duration;

use crate::{cmap::conn::wire, hello::HelloReply, sdam::public::ServerType};

/// The handshake view of a server, captured when a connection was established. Wire version and
/// size checks on a connection consult this, never the live topology.
#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The supported authentication mechanisms reported for the handshake user, if any.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server stay alive after their last use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of a single BSON document the server accepts.
    pub(crate) max_bson_object_size: i64,

    /// The maximum size of a wire protocol message the server accepts.
    pub(crate) max_message_size_bytes: i32,

    /// The maximum number of writes the server accepts in one batch.
    pub(crate) max_write_batch_size: i64,

    /// Whether the server accepts the `hello` command name for monitoring.
    pub(crate) hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_bson_object_size: response.max_bson_object_size,
            max_message_size_bytes: if response.max_message_size_bytes > 0 {
                response.max_message_size_bytes
            } else {
                wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES
            },
            max_write_batch_size: response.max_write_batch_size.unwrap_or(100_000),
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }

    /// Whether this connection supports the 4.4+ streamable hello / awaitable monitoring
    /// protocol.
    pub(crate) fn supports_streaming_monitoring(&self) -> bool {
        self.max_wire_version.map(|v| v >= 9).unwrap_or(false)
    }

    /// Whether the server behind this connection can deduplicate retried writes: it must
    /// support sessions and not be a standalone.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.max_wire_version.map(|v| v >= 6).unwrap_or(false)
    }

    /// Gets a description of a stream for a 4.2 server, for use in tests.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            initial_server_type: ServerType::Standalone,
            max_wire_version: Some(8),
            min_wire_version: Some(6),
            sasl_supported_mechs: None,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            max_write_batch_size: 100_000,
            hello_ok: false,
        }
    }
}
