use serde::de::DeserializeOwned;

use crate::{
    bson::{Bson, Document},
    bson_util,
    client::session::ClusterTime,
    error::{CommandError, Error, ErrorKind, Result, WriteConcernError, WriteFailure},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::ReadPreference,
};

/// Driver-side model of a database command, containing everything needed to serialize it into an
/// `OP_MSG`.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) exhaust_allowed: bool,
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

/// A kind-1 `OP_MSG` payload: a named sequence of documents pulled out of the command body.
#[derive(Debug, Clone)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            exhaust_allowed: false,
            document_sequences: Vec::new(),
        }
    }

    /// Attach a document sequence to be sent as a kind-1 payload section.
    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: Vec<Document>,
    ) {
        self.document_sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
    }

    pub(crate) fn set_session_id(&mut self, lsid: &Document) {
        self.body.insert("lsid", lsid.clone());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        // this serialization should never fail.
        if let Ok(doc) = crate::bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.into_document());
    }

    /// Whether command monitoring must redact this command's body before exposing it. `hello` is
    /// only sensitive when it carries a speculative authentication payload.
    pub(crate) fn should_redact(&self) -> bool {
        const REDACTED_COMMANDS: &[&str] = &[
            "saslstart",
            "saslcontinue",
            "getnonce",
            "authenticate",
            "createuser",
            "updateuser",
            "copydbsaslstart",
            "copydbgetnonce",
            "copydb",
        ];

        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(&name.as_str())
            || ((name == "hello" || name == "ismaster")
                && self.body.contains_key("speculativeAuthenticate"))
    }
}

/// A server reply carried as raw BSON until the caller decides what shape to deserialize it to.
#[derive(Debug, Clone)]
pub(crate) struct RawCommandResponse {
    pub(crate) source: ServerAddress,
    raw: Vec<u8>,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, document: &Document) -> Result<Self> {
        let raw = bson_util::document_to_vec(document)?;
        Ok(Self { source, raw })
    }

    /// Deserialize the body of this response to the given shape.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_slice(&self.raw).map_err(|e| {
            Error::from(ErrorKind::InvalidResponse {
                message: format!("{}", e),
            })
        })
    }

    pub(crate) fn to_document(&self) -> Result<Document> {
        self.body()
    }

    /// Extract a server-side error from this response if `ok` is falsy, otherwise return the
    /// decoded document.
    pub(crate) fn ok_or_command_error(&self) -> Result<Document> {
        let doc = self.to_document()?;

        let ok = doc
            .get("ok")
            .and_then(bson_util::get_int)
            .ok_or_else(|| Error::invalid_response("server reply missing `ok` field"))?;

        if ok == 1 {
            // A successful reply can still carry a write concern error.
            if let Some(Bson::Document(wce)) = doc.get("writeConcernError") {
                let wc_error: WriteConcernError =
                    crate::bson::from_document(wce.clone()).map_err(Error::from)?;
                let labels: Option<Vec<String>> = doc
                    .get_array("errorLabels")
                    .ok()
                    .map(|labels| {
                        labels
                            .iter()
                            .filter_map(|l| l.as_str().map(String::from))
                            .collect()
                    });
                return Err(Error::new(
                    ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)),
                    labels,
                ));
            }
            return Ok(doc);
        }

        let command_error: CommandError =
            crate::bson::from_document(doc.clone()).map_err(Error::from)?;
        let labels: Option<Vec<String>> = doc.get_array("errorLabels").ok().map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.as_str().map(String::from))
                .collect()
        });

        Err(Error::new(ErrorKind::Command(command_error), labels))
    }

    /// The `$clusterTime` the server attached to this reply, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        #[derive(serde::Deserialize)]
        struct ClusterTimeOnly {
            #[serde(rename = "$clusterTime")]
            cluster_time: Option<ClusterTime>,
        }
        self.body::<ClusterTimeOnly>()
            .ok()
            .and_then(|b| b.cluster_time)
    }

    /// Interpret this response as the reply to a `hello` command.
    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        let raw_command_response = self.ok_or_command_error()?;
        let command_response: HelloCommandResponse = self.body()?;
        let cluster_time = self.cluster_time();

        Ok(HelloReply {
            server_address: self.source,
            command_response,
            raw_command_response,
            cluster_time,
        })
    }
}

#[cfg(test)]
mod test {
    use crate::bson::doc;

    use super::*;

    fn response(doc: Document) -> RawCommandResponse {
        RawCommandResponse::new(ServerAddress::default(), &doc).unwrap()
    }

    #[test]
    fn ok_zero_becomes_command_error() {
        let err = response(doc! {
            "ok": 0,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "not master",
        })
        .ok_or_command_error()
        .unwrap_err();

        assert_eq!(err.sdam_code(), Some(10107));
        assert!(err.is_notwritableprimary());
    }

    #[test]
    fn write_concern_errors_surface_from_ok_replies() {
        let err = response(doc! {
            "ok": 1,
            "n": 1,
            "writeConcernError": {
                "code": 91,
                "codeName": "ShutdownInProgress",
                "errmsg": "shutting down",
            },
        })
        .ok_or_command_error()
        .unwrap_err();

        assert_eq!(err.sdam_code(), Some(91));
        assert!(err.is_recovering());
    }

    #[test]
    fn error_labels_are_propagated() {
        let err = response(doc! {
            "ok": 0,
            "code": 112,
            "codeName": "WriteConflict",
            "errmsg": "conflict",
            "errorLabels": ["TransientTransactionError"],
        })
        .ok_or_command_error()
        .unwrap_err();

        assert!(err.contains_label("TransientTransactionError"));
    }

    #[test]
    fn sensitive_commands_are_redacted() {
        assert!(Command::new("saslStart", "admin", doc! { "saslStart": 1 }).should_redact());
        let mut hello = Command::new("hello", "admin", doc! { "hello": 1 });
        assert!(!hello.should_redact());
        hello.body.insert("speculativeAuthenticate", doc! {});
        assert!(hello.should_redact());
        assert!(!Command::new("find", "db", doc! { "find": "coll" }).should_redact());
    }
}
