use crate::{
    bson::Document,
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result, WriteConcernError, WriteFailure},
    namespace::Namespace,
    operation::{Operation, Retryability},
    results::InsertManyResult,
};

use serde::Deserialize;

/// Overhead allowed for the command document around the `documents` sequence: command name,
/// collection, flags, lsid, txnNumber, write concern, and the section headers.
const COMMAND_OVERHEAD_SIZE: u64 = 16 * 1024;

/// An `insert` command. The documents ride in an `OP_MSG` document sequence, and a single
/// `Insert` may require several executions when the payload exceeds the server's size or batch
/// count limits: each call to `build` consumes as many remaining documents as fit.
#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    ordered: bool,
    write_concern: Option<WriteConcern>,

    /// Index of the first document not yet sent.
    offset: usize,

    /// How many documents the most recent `build` call claimed.
    current_batch_size: usize,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        ordered: bool,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            documents,
            ordered,
            write_concern,
            offset: 0,
            current_batch_size: 0,
        }
    }

    /// Whether all documents have been claimed by `build` calls.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.offset >= self.documents.len()
    }

    /// Marks the current batch as successfully executed.
    pub(crate) fn advance_batch(&mut self) {
        self.offset += self.current_batch_size;
        self.current_batch_size = 0;
    }
}

impl Operation for Insert {
    type O = InsertManyResult;
    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        let max_doc_size = description.max_bson_object_size as u64;
        let max_message_size = description.max_message_size_bytes as u64 - COMMAND_OVERHEAD_SIZE;
        let max_batch_count = description.max_write_batch_size as usize;

        let mut batch = Vec::new();
        let mut batch_bytes: u64 = 0;

        for document in &self.documents[self.offset..] {
            if batch.len() == max_batch_count {
                break;
            }

            let doc_size = bson_util::doc_size_bytes(document)?;
            if doc_size > max_doc_size {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "insert document must be within {} bytes, but one was {} bytes",
                        max_doc_size, doc_size
                    ),
                }
                .into());
            }

            if !batch.is_empty() && batch_bytes + doc_size > max_message_size {
                break;
            }

            batch_bytes += doc_size;
            batch.push(document.clone());
        }

        if batch.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "insert requires at least one document".to_string(),
            }
            .into());
        }

        self.current_batch_size = batch.len();

        let mut body = crate::bson::doc! {
            Self::NAME: self.ns.coll.clone(),
            "ordered": self.ordered,
        };

        if let Some(ref write_concern) = self.write_concern {
            body.insert("writeConcern", crate::bson::to_bson(write_concern)?);
        }

        let mut command = Command::new(Self::NAME, self.ns.db.clone(), body);
        command.add_document_sequence("documents", batch);

        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.ok_or_command_error()?;
        let body: InsertResponseBody = response.body()?;

        if let Some(write_errors) = body.write_errors {
            if let Some(first) = write_errors.into_iter().next() {
                return Err(Error::new(
                    ErrorKind::Write(WriteFailure::WriteError(first)),
                    body.labels,
                ));
            }
        }

        if let Some(wc_error) = body.write_concern_error {
            return Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)),
                body.labels,
            ));
        }

        Ok(InsertManyResult {
            inserted_count: body.n,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[derive(Debug, Deserialize)]
struct InsertResponseBody {
    n: u64,

    #[serde(rename = "writeErrors")]
    write_errors: Option<Vec<crate::error::WriteError>>,

    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

#[cfg(test)]
mod test {
    use crate::{
        bson::doc,
        cmap::conn::wire::{Message, MessageSection},
    };

    use super::*;

    fn small_server() -> StreamDescription {
        let mut description = StreamDescription::new_testing();
        // Tight message budget so a couple of documents force a split.
        description.max_message_size_bytes = (COMMAND_OVERHEAD_SIZE + 300) as i32;
        description.max_bson_object_size = 200;
        description
    }

    fn docs_of_size(count: usize, payload: usize) -> Vec<Document> {
        (0..count)
            .map(|i| doc! { "_id": i as i64, "pad": "x".repeat(payload) })
            .collect()
    }

    #[test]
    fn oversized_payload_splits_into_multiple_batches() {
        let description = small_server();
        let documents = docs_of_size(4, 120);
        let total = documents.len();

        let mut op = Insert::new(Namespace::new("db", "coll"), documents, true, None);

        let mut batch_counts = Vec::new();
        while !op.is_exhausted() {
            let cmd = op.build(&description).unwrap();
            let batch_len = cmd.document_sequences[0].documents.len();
            assert!(batch_len >= 1);
            batch_counts.push(batch_len);
            op.advance_batch();
        }

        assert!(batch_counts.len() > 1, "payload should have split");
        assert_eq!(batch_counts.iter().sum::<usize>(), total);
    }

    #[test]
    fn each_batch_fits_in_a_wire_message() {
        let description = small_server();
        let mut op = Insert::new(
            Namespace::new("db", "coll"),
            docs_of_size(6, 100),
            true,
            None,
        );

        while !op.is_exhausted() {
            let cmd = op.build(&description).unwrap();
            let message = Message::from_command(cmd, Some(1));
            match &message.sections[1] {
                MessageSection::Sequence { identifier, .. } => {
                    assert_eq!(identifier, "documents")
                }
                other => panic!("expected a document sequence, got {:?}", other),
            }
            op.advance_batch();
        }
    }

    #[test]
    fn document_over_bson_limit_is_rejected() {
        let description = small_server();
        let mut op = Insert::new(
            Namespace::new("db", "coll"),
            docs_of_size(1, 500),
            true,
            None,
        );
        let err = op.build(&description).unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn write_errors_surface_from_ok_replies() {
        let op = Insert::new(
            Namespace::new("db", "coll"),
            vec![doc! { "x": 1 }],
            true,
            None,
        );
        let response = RawCommandResponse::new(
            crate::options::ServerAddress::default(),
            &doc! {
                "ok": 1,
                "n": 0,
                "writeErrors": [ { "index": 0, "code": 11000, "errmsg": "duplicate key" } ],
            },
        )
        .unwrap();

        let err = op
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap_err();
        assert!(matches!(
            *err.kind,
            ErrorKind::Write(WriteFailure::WriteError(_))
        ));
    }
}
