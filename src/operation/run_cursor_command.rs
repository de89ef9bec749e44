use std::time::Duration;

use crate::{
    bson::Document,
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    operation::{run_command::RunCommand, CursorBody, Operation},
    selection_criteria::SelectionCriteria,
};

/// An arbitrary cursor-producing command provided by the application (e.g. `find`, `aggregate`,
/// `listIndexes`), forwarded as-is and answered with a `Cursor`.
#[derive(Debug)]
pub(crate) struct RunCursorCommand {
    run_command: RunCommand,
    batch_size: Option<u32>,
    max_time: Option<Duration>,
}

impl RunCursorCommand {
    pub(crate) fn new(
        db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
        batch_size: Option<u32>,
        max_time: Option<Duration>,
    ) -> Result<Self> {
        Ok(Self {
            run_command: RunCommand::new(db, command, selection_criteria)?,
            batch_size,
            max_time,
        })
    }
}

impl Operation for RunCursorCommand {
    type O = CursorSpecification;
    const NAME: &'static str = "";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.run_command.build(description)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.ok_or_command_error()?;
        let body: CursorBody = response.body()?;

        Ok(CursorSpecification::new(
            body.cursor,
            response.source,
            self.batch_size,
            self.max_time,
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.run_command.selection_criteria()
    }

    fn name(&self) -> &str {
        self.run_command.name()
    }
}
