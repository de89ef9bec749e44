use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    namespace::Namespace,
    operation::{CursorBody, Operation, Retryability},
    selection_criteria::SelectionCriteria,
};

#[derive(Debug)]
pub(crate) struct Aggregate {
    ns: Namespace,
    pipeline: Vec<Document>,
    batch_size: Option<u32>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Aggregate {
    pub(crate) fn new(
        ns: Namespace,
        pipeline: impl IntoIterator<Item = Document>,
        batch_size: Option<u32>,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            ns,
            pipeline: pipeline.into_iter().collect(),
            batch_size,
            selection_criteria,
        }
    }

    /// Whether the pipeline ends in a stage that writes, which rules out read retries.
    fn is_out_or_merge(&self) -> bool {
        self.pipeline
            .last()
            .and_then(bson_util::first_key)
            .map(|name| name == "$out" || name == "$merge")
            .unwrap_or(false)
    }
}

impl Operation for Aggregate {
    type O = CursorSpecification;
    const NAME: &'static str = "aggregate";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut cursor = Document::new();
        if let Some(batch_size) = self.batch_size {
            cursor.insert("batchSize", i64::from(batch_size));
        }

        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "pipeline": self.pipeline.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
            "cursor": cursor,
        };

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
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

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.is_out_or_merge() {
            Retryability::None
        } else {
            Retryability::Read
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn out_and_merge_disable_read_retries() {
        let plain = Aggregate::new(
            Namespace::new("db", "coll"),
            vec![doc! { "$match": { "x": 1 } }],
            None,
            None,
        );
        assert_eq!(plain.retryability(), Retryability::Read);

        let with_out = Aggregate::new(
            Namespace::new("db", "coll"),
            vec![doc! { "$match": {} }, doc! { "$out": "target" }],
            None,
            None,
        );
        assert_eq!(with_out.retryability(), Retryability::None);
    }

    #[test]
    fn cursor_subdocument_carries_batch_size() {
        let mut op = Aggregate::new(Namespace::new("db", "coll"), vec![], Some(10), None);
        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(
            cmd.body.get_document("cursor").unwrap(),
            &doc! { "batchSize": 10_i64 }
        );
    }
}
