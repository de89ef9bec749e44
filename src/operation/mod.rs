mod aggregate;
pub(crate) mod find;
mod get_more;
mod insert;
mod kill_cursors;
mod list_collections;
mod run_command;
mod run_cursor_command;

use std::collections::VecDeque;

use serde::Deserialize;

use crate::{
    bson::Document,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::Result,
    namespace::Namespace,
    selection_criteria::SelectionCriteria,
};

pub(crate) use self::{
    aggregate::Aggregate,
    find::{CursorType, Find, FindOptions},
    get_more::GetMore,
    insert::Insert,
    kill_cursors::KillCursors,
    list_collections::ListCollections,
    run_command::RunCommand,
    run_cursor_command::RunCursorCommand,
};

/// A trait modeling the behavior of a server-side operation.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server-side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store additional state that is required for handling the response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command. The response is guaranteed not to be a
    /// top-level command error.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// The pool generation this operation is pinned to, if any. An operation pinned to a
    /// generation fails fatally when executed on a connection from a newer one.
    fn pinned_generation(&self) -> Option<u32> {
        None
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// The level of retry support an operation has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// The shape of a reply to a cursor-producing command.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

/// Models the `cursor` field of a cursor-producing command's reply.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: Namespace,

    #[serde(default)]
    pub(crate) first_batch: VecDeque<Document>,
}

/// Appends the given options document onto a command body, overwriting duplicated keys.
pub(crate) fn append_options(doc: &mut Document, options: Option<&Document>) {
    if let Some(options) = options {
        doc.extend(options.clone());
    }
}
