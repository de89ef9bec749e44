mod header;
mod message;
pub(crate) mod util;

pub(crate) use self::{
    header::{Header, OpCode},
    message::{Message, MessageFlags, MessageSection},
};

/// The default maximum message size (48 MiB), used until a handshake reports the server's
/// actual `maxMessageSizeBytes`.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;
