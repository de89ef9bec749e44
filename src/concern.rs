//! Contains the types for read concerns and write concerns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result};

/// Specifies the consistency and isolation properties of read operations on replica sets and
/// sharded clusters.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/reference/read-concern/) for more
/// information about read concerns.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadConcern {
    /// The level of the read concern.
    pub level: ReadConcernLevel,
}

/// Specifies the level consistency and isolation properties of a given `ReadConcern`.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/reference/read-concern/) for more
/// information about read concern levels.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-local/).
    Local,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-majority/).
    Majority,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-linearizable/).
    Linearizable,

    /// See the specific documentation for this read concern level [here](https://www.mongodb.com/docs/manual/reference/read-concern-available/).
    Available,

    /// Specify a custom read concern level. This is present to provide forwards compatibility with
    /// any future read concerns which may be added to new versions of MongoDB.
    #[serde(untagged)]
    Custom(String),
}

impl ReadConcern {
    /// Creates a read concern with level "majority".
    pub fn majority() -> Self {
        ReadConcernLevel::Majority.into()
    }

    /// Creates a read concern with level "local".
    pub fn local() -> Self {
        ReadConcernLevel::Local.into()
    }

    /// Creates a read concern with level "linearizable".
    pub fn linearizable() -> Self {
        ReadConcernLevel::Linearizable.into()
    }

    /// Creates a read concern with level "available".
    pub fn available() -> Self {
        ReadConcernLevel::Available.into()
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

/// Specifies the level of acknowledgment requested from the server for write operations.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/reference/write-concern/) for more
/// information about write concerns.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WriteConcern {
    /// Requests acknowledgment that the operation has propagated to a specific number or variety
    /// of servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<Acknowledgment>,

    /// Specifies a time limit for the write concern. If an operation has not propagated to the
    /// requested level within the time limit, an error will return.
    ///
    /// Note that an error being returned due to a write concern error does not imply that the
    /// write would not have finished propagating if allowed more time to finish, and the server
    /// will not roll back the writes that occurred before the timeout was reached.
    #[serde(
        rename = "wtimeout",
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::serde_util::serialize_duration_option_as_int_millis",
        default
    )]
    pub w_timeout: Option<Duration>,

    /// Requests acknowledgment that the operation has propagated to the on-disk journal.
    #[serde(rename = "j", skip_serializing_if = "Option::is_none")]
    pub journal: Option<bool>,
}

/// The type of the `w` field in a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Requires acknowledgment that the write has propagated to the specified number of nodes.
    ///
    /// Note: specifying 0 here indicates that the write concern is unacknowledged, which means the
    /// server will not return a response for the operation.
    Nodes(u32),

    /// Requires acknowledgment that the write has propagated to the majority of nodes.
    Majority,

    /// Requires acknowledgment according to the given custom write concern. See [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/#tag-sets-and-custom-write-concern-behavior)
    /// for more information.
    Custom(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Acknowledgment::Nodes(n) => serializer.serialize_u32(*n),
            Acknowledgment::Majority => serializer.serialize_str("majority"),
            Acknowledgment::Custom(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntOrString {
            Int(u32),
            String(String),
        }
        match IntOrString::deserialize(deserializer)? {
            IntOrString::Int(i) => Ok(i.into()),
            IntOrString::String(s) => Ok(s.into()),
        }
    }
}

impl From<u32> for Acknowledgment {
    fn from(i: u32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Custom(s)
        }
    }
}

impl WriteConcern {
    /// A write concern requesting majority acknowledgment.
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            w_timeout: None,
            journal: None,
        }
    }

    /// Whether the write concern requests acknowledgment from the server. Unacknowledged writes
    /// cannot be retried and do not report write errors.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Validates that the write concern is consistent. A write concern requesting no
    /// acknowledgment cannot also request journaling, as the latter implies waiting on the
    /// server.
    pub fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(ErrorKind::InvalidArgument {
                message: "write concern cannot have w=0 and j=true".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::bson::doc;

    use super::*;

    #[test]
    fn w_zero_with_journal_is_rejected() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(0)),
            w_timeout: None,
            journal: Some(true),
        };
        assert!(wc.validate().is_err());
    }

    #[test]
    fn unacknowledged_is_detected() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(0)),
            w_timeout: None,
            journal: None,
        };
        assert!(!wc.is_acknowledged());
        assert!(WriteConcern::majority().is_acknowledged());
    }

    #[test]
    fn serializes_to_server_shape() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Majority),
            w_timeout: Some(Duration::from_millis(100)),
            journal: Some(true),
        };
        let doc = crate::bson::to_document(&wc).unwrap();
        assert_eq!(doc, doc! { "w": "majority", "wtimeout": 100_i64, "j": true });
    }
}
