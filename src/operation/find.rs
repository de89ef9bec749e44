use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    namespace::Namespace,
    operation::{CursorBody, Operation, Retryability},
    selection_criteria::SelectionCriteria,
};

/// The type of cursor a `find` should create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum CursorType {
    /// A cursor that exhausts once all matching documents have been returned.
    #[default]
    NonTailable,

    /// A cursor that stays open after returning its last result, resuming when more arrive.
    /// Only valid on capped collections.
    Tailable,

    /// A tailable cursor on which the server blocks for new results for up to
    /// [`FindOptions::max_await_time`] per batch.
    TailableAwait,
}

/// The options for a `find` command that the driver core acts on directly. Anything else can be
/// passed through the `extra` document, which is merged into the command body verbatim.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct FindOptions {
    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// The maximum number of documents to return. A negative limit requests a single batch.
    pub limit: Option<i64>,

    /// Whether the cursor should be tailable, and if so whether the server should block waiting
    /// for new data.
    pub cursor_type: Option<CursorType>,

    /// For tailable await cursors, how long the server blocks for new results before returning
    /// an empty batch.
    pub max_await_time: Option<Duration>,

    /// An arbitrary comment attached to the command, visible in server logs and profiles.
    pub comment: Option<Bson>,

    /// The selection criteria for the operation, overriding the client default.
    pub selection_criteria: Option<SelectionCriteria>,

    /// Additional fields merged into the command body as-is.
    pub extra: Option<Document>,
}

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Option<Document>,
    options: FindOptions,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Option<Document>, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options: options.unwrap_or_default(),
        }
    }
}

impl Operation for Find {
    type O = CursorSpecification;
    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());
        }

        match self.options.cursor_type.unwrap_or_default() {
            CursorType::NonTailable => {}
            CursorType::Tailable => {
                body.insert("tailable", true);
            }
            CursorType::TailableAwait => {
                body.insert("tailable", true);
                body.insert("awaitData", true);
            }
        }

        if let Some(batch_size) = self.options.batch_size {
            body.insert("batchSize", i64::from(batch_size));
        }

        if let Some(limit) = self.options.limit {
            // Negative limits are a request for a single batch as per the CRUD spec.
            body.insert("limit", limit.abs());
            if limit < 0 {
                body.insert("singleBatch", true);
            }
        }

        if let Some(ref comment) = self.options.comment {
            body.insert("comment", comment.clone());
        }

        super::append_options(&mut body, self.options.extra.as_ref());

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.ok_or_command_error()?;
        let body: CursorBody = response.body()?;

        let max_await_time = match self.options.cursor_type.unwrap_or_default() {
            CursorType::TailableAwait => self.options.max_await_time,
            _ => None,
        };

        Ok(CursorSpecification::new(
            body.cursor,
            response.source,
            self.options.batch_size,
            max_await_time,
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options.selection_criteria.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[cfg(test)]
mod test {
    use crate::options::ServerAddress;

    use super::*;

    #[test]
    fn tailable_await_sets_both_flags() {
        let mut op = Find::new(
            Namespace::new("db", "coll"),
            None,
            Some(
                FindOptions::builder()
                    .cursor_type(CursorType::TailableAwait)
                    .max_await_time(Duration::from_secs(1))
                    .build(),
            ),
        );
        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert!(cmd.body.get_bool("tailable").unwrap());
        assert!(cmd.body.get_bool("awaitData").unwrap());
    }

    #[test]
    fn negative_limit_requests_single_batch() {
        let mut op = Find::new(
            Namespace::new("db", "coll"),
            None,
            Some(FindOptions::builder().limit(-5_i64).build()),
        );
        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(cmd.body.get_i64("limit").unwrap(), 5);
        assert!(cmd.body.get_bool("singleBatch").unwrap());
    }

    #[test]
    fn first_batch_becomes_cursor_buffer() {
        let op = Find::new(Namespace::new("db", "coll"), None, None);
        let response = RawCommandResponse::new(
            ServerAddress::default(),
            &doc! {
                "ok": 1,
                "cursor": {
                    "id": 123_i64,
                    "ns": "db.coll",
                    "firstBatch": [ { "x": 1 }, { "x": 2 } ],
                },
            },
        )
        .unwrap();

        let spec = op
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap();
        assert_eq!(spec.id(), 123);
        assert_eq!(spec.initial_buffer.len(), 2);
        assert_eq!(spec.info.ns, Namespace::new("db", "coll"));
    }
}
