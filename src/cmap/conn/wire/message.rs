use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{
    bson::Document,
    bson_util,
    cmap::conn::command::Command,
    compression::{compressors::Compressor, decompress::decompress_message},
    counters,
    error::{Error, ErrorKind, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) sections: Vec<MessageSection>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. The command's document sequences, if any,
    /// become kind-1 payload sections.
    pub(crate) fn from_command(mut command: Command, request_id: Option<i32>) -> Self {
        command.body.insert("$db", command.target_db);

        let mut flags = MessageFlags::empty();
        if command.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        let mut sections = vec![MessageSection::Document(command.body)];
        sections.extend(
            command
                .document_sequences
                .into_iter()
                .map(|seq| MessageSection::Sequence {
                    identifier: seq.identifier,
                    documents: seq.documents,
                }),
        );

        Self {
            response_to: 0,
            flags,
            sections,
            checksum: None,
            request_id,
        }
    }

    /// Gets the first document contained in this Message.
    pub(crate) fn single_document_response(self) -> Result<Document> {
        self.sections
            .into_iter()
            .next()
            .and_then(|section| match section {
                MessageSection::Document(doc) => Some(doc),
                MessageSection::Sequence { documents, .. } => documents.into_iter().next(),
            })
            .ok_or_else(|| Error::invalid_response("no document in server reply"))
    }

    /// Reads bytes from `reader` and deserializes them into a Message, inflating an
    /// `OP_COMPRESSED` frame if necessary.
    ///
    /// Replies whose declared length falls outside `[header, max_message_size_bytes]` poison the
    /// stream, so the connection must be discarded by the caller.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        max_message_size_bytes: i32,
    ) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        if header.length < Header::LENGTH as i32 || header.length > max_message_size_bytes {
            return Err(Error::invalid_response(format!(
                "The server indicated a reply of {} bytes, but replies must be between {} and {} \
                 bytes",
                header.length,
                Header::LENGTH,
                max_message_size_bytes,
            )));
        }

        let body_len = (header.length as usize) - Header::LENGTH;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;

        counters::incr(&counters::OP_INGRESS_TOTAL);

        match header.op_code {
            OpCode::Message => {
                counters::incr(&counters::OP_INGRESS_MSG);
                Self::parse_op_msg_body(header.response_to, &body)
            }
            OpCode::Compressed => {
                counters::incr(&counters::OP_INGRESS_COMPRESSED);
                Self::parse_op_compressed_body(header.response_to, &body)
            }
            other => Err(Error::invalid_response(format!(
                "unexpected opcode in server reply: {:?}",
                other
            ))),
        }
    }

    fn parse_op_compressed_body(response_to: i32, body: &[u8]) -> Result<Self> {
        if body.len() < 9 {
            return Err(Error::invalid_response(
                "OP_COMPRESSED body too short to contain its fields",
            ));
        }

        let original_opcode = i32::from_le_bytes(body[0..4].try_into().expect("sliced 4 bytes"));
        let uncompressed_size = i32::from_le_bytes(body[4..8].try_into().expect("sliced 4 bytes"));
        let compressor_id = body[8];

        if OpCode::from_i32(original_opcode)? != OpCode::Message {
            return Err(Error::invalid_response(format!(
                "OP_COMPRESSED wraps unexpected original opcode {}",
                original_opcode
            )));
        }

        let inflated = decompress_message(&body[9..], compressor_id)?;
        if inflated.len() as i64 != uncompressed_size as i64 {
            return Err(Error::invalid_response(format!(
                "OP_COMPRESSED declared an uncompressed size of {} but inflating produced {}",
                uncompressed_size,
                inflated.len(),
            )));
        }

        Self::parse_op_msg_body(response_to, &inflated)
    }

    fn parse_op_msg_body(response_to: i32, body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::invalid_response("OP_MSG body missing flag bits"));
        }

        let flags =
            MessageFlags::from_bits_truncate(u32::from_le_bytes(
                body[0..4].try_into().expect("sliced 4 bytes"),
            ));

        let mut remaining = &body[4..];
        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };

        let mut sections = Vec::new();
        while remaining.len() > checksum_len {
            let (section, rest) = MessageSection::parse(remaining)?;
            sections.push(section);
            remaining = rest;
        }

        let checksum = if checksum_len == 4 {
            if remaining.len() != 4 {
                return Err(Error::invalid_response(
                    "OP_MSG declared a checksum but did not include one",
                ));
            }
            Some(u32::from_le_bytes(
                remaining.try_into().expect("checked 4 bytes"),
            ))
        } else if !remaining.is_empty() {
            return Err(Error::invalid_response(
                "OP_MSG contained trailing bytes after its sections",
            ));
        } else {
            None
        };

        Ok(Self {
            response_to,
            flags,
            sections,
            checksum,
            request_id: None,
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    ///
    /// Returns the request id used, for reply correlation.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        max_message_size_bytes: i32,
    ) -> Result<i32> {
        let sections_bytes = self.sections_bytes()?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections_bytes.len()
            + self.checksum.map(|_| 4usize).unwrap_or(0);

        if total_length > max_message_size_bytes as usize {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "attempted to send a message of {} bytes, but the server only accepts up to \
                     {} bytes",
                    total_length, max_message_size_bytes
                ),
            }
            .into());
        }

        let request_id = self.request_id.unwrap_or_else(util::next_request_id);

        let header = Header {
            length: total_length.try_into().map_err(|_| {
                Error::invalid_argument("message length does not fit in a 32-bit integer")
            })?,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&sections_bytes).await?;

        if let Some(checksum) = self.checksum {
            writer.write_all(&checksum.to_le_bytes()).await?;
        }

        writer.flush().await?;

        counters::incr(&counters::OP_EGRESS_MSG);
        counters::incr(&counters::OP_EGRESS_TOTAL);

        Ok(request_id)
    }

    /// Serializes the Message, compresses it with `compressor`, and writes the resulting
    /// `OP_COMPRESSED` frame to `writer`.
    pub(crate) async fn write_op_compressed_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        compressor: &Compressor,
        max_message_size_bytes: i32,
    ) -> Result<i32> {
        let sections_bytes = self.sections_bytes()?;
        let flag_bytes = self.flags.bits().to_le_bytes();
        let uncompressed_len = sections_bytes.len() + flag_bytes.len();

        let compressed = compressor.compress(&flag_bytes, &sections_bytes)?;

        let total_length = Header::LENGTH + 4 + 4 + 1 + compressed.len();
        if total_length > max_message_size_bytes as usize {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "attempted to send a message of {} bytes, but the server only accepts up to \
                     {} bytes",
                    total_length, max_message_size_bytes
                ),
            }
            .into());
        }

        let request_id = self.request_id.unwrap_or_else(util::next_request_id);

        let header = Header {
            length: total_length.try_into().map_err(|_| {
                Error::invalid_argument("message length does not fit in a 32-bit integer")
            })?,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_all(&(OpCode::Message as i32).to_le_bytes())
            .await?;
        let uncompressed_size: i32 = uncompressed_len.try_into().map_err(|_| {
            Error::invalid_argument("message length does not fit in a 32-bit integer")
        })?;
        writer.write_all(&uncompressed_size.to_le_bytes()).await?;
        writer.write_all(&[compressor.id()]).await?;
        writer.write_all(&compressed).await?;
        writer.flush().await?;

        counters::incr(&counters::OP_EGRESS_COMPRESSED);
        counters::incr(&counters::OP_EGRESS_TOTAL);

        Ok(request_id)
    }

    fn sections_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for section in &self.sections {
            section.write(&mut bytes)?;
        }
        Ok(bytes)
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section as defined by the OP_MSG spec.
#[derive(Debug)]
pub(crate) enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl MessageSection {
    /// Parses a section from the front of `bytes`, returning it along with the remainder.
    fn parse(bytes: &[u8]) -> Result<(Self, &[u8])> {
        let (payload_type, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::invalid_response("empty OP_MSG section"))?;

        if *payload_type == 0 {
            let doc_len = bson_util::read_document_length(rest)? as usize;
            if doc_len > rest.len() {
                return Err(Error::invalid_response(
                    "OP_MSG document section extends past the message",
                ));
            }
            let mut reader = &rest[..doc_len];
            let document = Document::from_reader(&mut reader)?;
            return Ok((MessageSection::Document(document), &rest[doc_len..]));
        }

        if *payload_type != 1 {
            return Err(Error::invalid_response(format!(
                "unknown OP_MSG section kind: {}",
                payload_type
            )));
        }

        let size = bson_util::read_document_length(rest)? as usize;
        if size < 4 || size > rest.len() {
            return Err(Error::invalid_response(
                "OP_MSG sequence section extends past the message",
            ));
        }
        let (section_bytes, remainder) = rest.split_at(size);

        let (identifier, mut doc_bytes) = util::parse_cstring(&section_bytes[4..])
            .ok_or_else(|| Error::invalid_response("OP_MSG sequence missing its identifier"))?;

        let mut documents = Vec::new();
        while !doc_bytes.is_empty() {
            let doc_len = bson_util::read_document_length(doc_bytes)? as usize;
            if doc_len > doc_bytes.len() {
                return Err(Error::invalid_response(
                    "OP_MSG sequence document extends past its section",
                ));
            }
            let mut reader = &doc_bytes[..doc_len];
            documents.push(Document::from_reader(&mut reader)?);
            doc_bytes = &doc_bytes[doc_len..];
        }

        Ok((
            MessageSection::Sequence {
                identifier: identifier.to_string(),
                documents,
            },
            remainder,
        ))
    }

    /// Serializes the MessageSection and appends the bytes to `buf`.
    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Document(doc) => {
                buf.push(0);
                doc.to_writer(&mut *buf)?;
            }
            Self::Sequence {
                identifier,
                documents,
            } => {
                buf.push(1);

                let mut section = Vec::new();
                util::write_cstring(&mut section, identifier);
                for doc in documents {
                    doc.to_writer(&mut section)?;
                }

                let size: i32 = (section.len() + 4).try_into().map_err(|_| {
                    Error::invalid_argument("sequence section length does not fit in 32 bits")
                })?;
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&section);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        bson::doc,
        cmap::conn::{
            command::Command,
            wire::{Header, DEFAULT_MAX_MESSAGE_SIZE_BYTES},
        },
    };

    use super::*;

    async fn encode(message: &Message) -> Vec<u8> {
        let mut buf = Vec::new();
        message
            .write_to(&mut buf, DEFAULT_MAX_MESSAGE_SIZE_BYTES)
            .await
            .unwrap();
        buf
    }

    async fn decode(mut bytes: &[u8]) -> Result<Message> {
        Message::read_from(&mut bytes, DEFAULT_MAX_MESSAGE_SIZE_BYTES).await
    }

    #[tokio::test]
    async fn command_round_trips_through_op_msg() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, Some(42));

        let bytes = encode(&message).await;
        let parsed = decode(&bytes).await.unwrap();

        assert_eq!(parsed.flags, MessageFlags::empty());
        assert_eq!(
            parsed.single_document_response().unwrap(),
            doc! { "ping": 1, "$db": "admin" }
        );
    }

    #[tokio::test]
    async fn document_sequences_round_trip() {
        let mut command = Command::new("insert", "db", doc! { "insert": "coll" });
        command.add_document_sequence("documents", vec![doc! { "x": 1 }, doc! { "x": 2 }]);
        let message = Message::from_command(command, None);

        let bytes = encode(&message).await;
        let parsed = decode(&bytes).await.unwrap();

        assert_eq!(parsed.sections.len(), 2);
        match &parsed.sections[1] {
            MessageSection::Sequence {
                identifier,
                documents,
            } => {
                assert_eq!(identifier, "documents");
                assert_eq!(documents, &[doc! { "x": 1 }, doc! { "x": 2 }]);
            }
            other => panic!("expected sequence section, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_reply_is_rejected() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, Some(1));
        let bytes = encode(&message).await;

        let err = Message::read_from(&mut bytes.as_slice(), 20).await.unwrap_err();
        assert!(
            matches!(*err.kind, ErrorKind::InvalidResponse { .. }),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn undersized_length_is_rejected() {
        let mut bytes = Vec::new();
        Header {
            length: (Header::LENGTH as i32) - 1,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Message,
        }
        .write_to(&mut bytes)
        .await
        .unwrap();

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn oversized_request_fails_before_dispatch() {
        let command = Command::new("ping", "admin", doc! { "ping": 1 });
        let message = Message::from_command(command, Some(1));

        let mut buf = Vec::new();
        let err = message.write_to(&mut buf, 20).await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));
        assert!(buf.is_empty(), "nothing should reach the stream");
    }

    #[tokio::test]
    async fn exhaust_allowed_sets_bit_sixteen() {
        let mut command = Command::new("hello", "admin", doc! { "hello": 1 });
        command.exhaust_allowed = true;
        let message = Message::from_command(command, None);
        assert!(message.flags.contains(MessageFlags::EXHAUST_ALLOWED));
        assert_eq!(message.flags.bits(), 1 << 16);
    }
}
