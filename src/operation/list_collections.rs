use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    operation::{CursorBody, Operation, Retryability},
};

#[derive(Debug)]
pub(crate) struct ListCollections {
    db: String,
    filter: Option<Document>,
    name_only: bool,
    batch_size: Option<u32>,
}

impl ListCollections {
    pub(crate) fn new(
        db: impl Into<String>,
        filter: Option<Document>,
        name_only: bool,
        batch_size: Option<u32>,
    ) -> Self {
        Self {
            db: db.into(),
            filter,
            name_only,
            batch_size,
        }
    }
}

impl Operation for ListCollections {
    type O = CursorSpecification;
    const NAME: &'static str = "listCollections";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };

        let mut name_only = self.name_only;
        if let Some(ref filter) = self.filter {
            body.insert("filter", filter.clone());

            // Filtering on anything but the name requires full collection info.
            if name_only && filter.keys().any(|k| k != "name") {
                name_only = false;
            }
        }
        body.insert("nameOnly", name_only);

        if let Some(batch_size) = self.batch_size {
            body.insert("cursor", doc! { "batchSize": i64::from(batch_size) });
        }

        Ok(Command::new(Self::NAME, self.db.clone(), body))
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
            None,
        ))
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filtering_beyond_name_disables_name_only() {
        let mut op = ListCollections::new("db", Some(doc! { "options.capped": true }), true, None);
        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert!(!cmd.body.get_bool("nameOnly").unwrap());

        let mut op = ListCollections::new("db", Some(doc! { "name": "x" }), true, None);
        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert!(cmd.body.get_bool("nameOnly").unwrap());
    }
}
