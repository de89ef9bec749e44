use std::collections::VecDeque;

use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    cursor::CursorInformation,
    error::Result,
    operation::Operation,
    results::GetMoreResult,
    selection_criteria::SelectionCriteria,
};

/// Retrieves the next batch for a cursor. Always pinned to the server and pool generation the
/// cursor was created under.
#[derive(Debug)]
pub(crate) struct GetMore {
    info: CursorInformation,
    selection_criteria: SelectionCriteria,
}

impl GetMore {
    pub(crate) fn new(info: CursorInformation) -> Self {
        let selection_criteria = SelectionCriteria::from_address(info.address.clone());
        Self {
            info,
            selection_criteria,
        }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;
    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.info.id,
            "collection": self.info.ns.coll.clone(),
        };

        if let Some(batch_size) = self.info.batch_size {
            if batch_size != 0 {
                body.insert("batchSize", i64::from(batch_size));
            }
        }

        if let Some(ref max_time) = self.info.max_time {
            body.insert(
                "maxTimeMS",
                i64::try_from(max_time.as_millis()).unwrap_or(i64::MAX),
            );
        }

        // Batches must ride the session that created the cursor, not the operation's own.
        if let Some(ref lsid) = self.info.lsid {
            body.insert("lsid", lsid.clone());
        }

        Ok(Command::new(Self::NAME, self.info.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.ok_or_command_error()?;
        let body: GetMoreResponseBody = response.body()?;

        Ok(GetMoreResult {
            batch: body.cursor.next_batch,
            exhausted: body.cursor.id == 0,
            id: body.cursor.id,
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    fn pinned_generation(&self) -> Option<u32> {
        Some(self.info.generation)
    }
}

#[derive(Debug, Deserialize)]
struct GetMoreResponseBody {
    cursor: NextBatchBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextBatchBody {
    id: i64,
    #[serde(default)]
    next_batch: VecDeque<Document>,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{namespace::Namespace, options::ServerAddress};

    use super::*;

    fn info() -> CursorInformation {
        CursorInformation {
            ns: Namespace::new("db", "coll"),
            address: ServerAddress::default(),
            generation: 3,
            id: 123,
            batch_size: Some(5),
            max_time: Some(Duration::from_millis(250)),
            lsid: None,
        }
    }

    #[test]
    fn command_carries_cursor_id_and_limits() {
        let mut op = GetMore::new(info());
        let cmd = op.build(&StreamDescription::new_testing()).unwrap();
        assert_eq!(cmd.body.get_i64("getMore").unwrap(), 123);
        assert_eq!(cmd.body.get_str("collection").unwrap(), "coll");
        assert_eq!(cmd.body.get_i64("batchSize").unwrap(), 5);
        assert_eq!(cmd.body.get_i64("maxTimeMS").unwrap(), 250);
        assert_eq!(op.pinned_generation(), Some(3));
    }

    #[test]
    fn zero_cursor_id_means_exhausted() {
        let op = GetMore::new(info());
        let response = RawCommandResponse::new(
            ServerAddress::default(),
            &crate::bson::doc! {
                "ok": 1,
                "cursor": { "id": 0_i64, "ns": "db.coll", "nextBatch": [ { "x": 1 } ] },
            },
        )
        .unwrap();

        let result = op
            .handle_response(response, &StreamDescription::new_testing())
            .unwrap();
        assert!(result.exhausted);
        assert_eq!(result.batch.len(), 1);
    }
}
