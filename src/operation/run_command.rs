use crate::{
    bson::Document,
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{ErrorKind, Result},
    operation::Operation,
    selection_criteria::SelectionCriteria,
};

/// An arbitrary command provided by the application, forwarded as-is.
#[derive(Debug)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if bson_util::first_key(&command).is_none() {
            return Err(ErrorKind::InvalidArgument {
                message: "an empty document cannot be run as a command".to_string(),
            }
            .into());
        }

        Ok(Self {
            db: db.into(),
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        // Non-emptiness is validated at construction.
        bson_util::first_key(&self.command).unwrap_or_default()
    }
}

impl Operation for RunCommand {
    type O = Document;

    // The actual command name is the first key of the user's document.
    const NAME: &'static str = "";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name(),
            self.db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.ok_or_command_error()
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}

#[cfg(test)]
mod test {
    use crate::bson::doc;

    use super::*;

    #[test]
    fn empty_commands_are_rejected() {
        assert!(RunCommand::new("admin", doc! {}, None).is_err());
    }

    #[test]
    fn command_name_is_first_key() {
        let mut op = RunCommand::new("admin", doc! { "ping": 1, "comment": "x" }, None).unwrap();
        assert_eq!(op.name(), "ping");

        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(cmd.name, "ping");
        assert_eq!(cmd.target_db, "admin");
        assert_eq!(cmd.body, doc! { "ping": 1, "comment": "x" });
    }
}
