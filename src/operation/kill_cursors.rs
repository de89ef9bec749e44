use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    namespace::Namespace,
    operation::Operation,
    options::ServerAddress,
    selection_criteria::SelectionCriteria,
};

/// Tells a server to discard cursor state. Fire-and-forget by contract: callers ignore failures.
#[derive(Debug)]
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_ids: Vec<i64>,
    selection_criteria: SelectionCriteria,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_ids: Vec<i64>, address: ServerAddress) -> Self {
        Self {
            ns,
            cursor_ids,
            selection_criteria: SelectionCriteria::from_address(address),
        }
    }
}

impl Operation for KillCursors {
    type O = ();
    const NAME: &'static str = "killCursors";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": self.cursor_ids.clone(),
        };

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.ok_or_command_error()?;
        Ok(())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_lists_cursor_ids() {
        let mut op = KillCursors::new(
            Namespace::new("db", "coll"),
            vec![123, 456],
            ServerAddress::default(),
        );
        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(cmd.body.get_str("killCursors").unwrap(), "coll");
        let ids = cmd.body.get_array("cursors").unwrap();
        assert_eq!(ids.len(), 2);
    }
}
