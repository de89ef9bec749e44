use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    client::session::ClusterTime,
    cmap::{Command, Connection},
    error::Result,
    options::ServerAddress,
    sdam::{public::ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If `load_balanced` is true or the server previously indicated `helloOk: true`, `hello` is
/// used. Otherwise legacy hello is used, and if it's unknown whether the server supports hello,
/// the command also advertises `helloOk: true`.
pub(crate) fn hello_command(
    load_balanced: Option<bool>,
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let (mut body, command_name) = if matches!(load_balanced, Some(true))
        || matches!(hello_ok, Some(true))
    {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if matches!(load_balanced, Some(true)) {
        body.insert("loadBalanced", true);
    }

    if let Some(opts) = awaitable_options {
        body.insert("topologyVersion", opts.topology_version);
        body.insert(
            "maxAwaitTimeMS",
            i64::try_from(opts.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    let mut command = Command::new(command_name, "admin", body);
    command.exhaust_allowed = awaitable_options.is_some();
    command
}

/// Execute a hello or legacy hello command.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    conn.send_command(command, None)
        .await
        .and_then(|raw_response| raw_response.into_hello_reply())
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
    pub(crate) cluster_time: Option<ClusterTime>,
}

/// The response to a `hello` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub(crate) is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub(crate) is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub(crate) hello_ok: Option<bool>,

    /// The list of all hosts.
    pub(crate) hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub(crate) passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub(crate) arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub(crate) msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub(crate) me: Option<String>,

    #[serde(rename = "compression")]
    /// The list of compatible compressors that the server returned.
    pub(crate) compressors: Option<Vec<String>>,

    /// The current replica set config version.
    pub(crate) set_version: Option<i32>,

    /// The name of the current replica set.
    pub(crate) set_name: Option<String>,

    /// Whether the server is hidden.
    pub(crate) hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub(crate) secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub(crate) arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a replica set.
    pub(crate) is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub(crate) last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub(crate) min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub(crate) max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub(crate) tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub(crate) election_id: Option<ObjectId>,

    /// The address of current primary member of the replica set.
    pub(crate) primary: Option<String>,

    /// A list of SASL mechanisms used to create the user's credential(s).
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// The reply to speculative authentication done in the authentication handshake.
    pub(crate) speculative_authenticate: Option<Document>,

    /// The maximum permitted size of a BSON object in bytes.
    #[serde(default = "default_max_bson_object_size")]
    pub(crate) max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a write batch.
    pub(crate) max_write_batch_size: Option<i64>,

    /// If the connection is to a load balancer, the id of the selected backend.
    pub(crate) service_id: Option<ObjectId>,

    /// For internal use.
    pub(crate) topology_version: Option<TopologyVersion>,

    /// The maximum permitted size of a BSON wire protocol message.
    #[serde(default)]
    pub(crate) max_message_size_bytes: i32,

    /// The server-generated ID for the connection the "hello" command was run on.
    /// Present on server versions 4.2+.
    pub(crate) connection_id: Option<i64>,
}

fn default_max_bson_object_size() -> i64 {
    16 * 1024 * 1024
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub(crate) last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_type_derivation_follows_sdam_rules() {
        let mut response = HelloCommandResponse::default();
        assert_eq!(response.server_type(), ServerType::Standalone);

        response.msg = Some("isdbgrid".to_string());
        assert_eq!(response.server_type(), ServerType::Mongos);
        response.msg = None;

        response.set_name = Some("rs".to_string());
        response.is_writable_primary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsPrimary);

        response.is_writable_primary = None;
        response.secondary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsSecondary);

        response.hidden = Some(true);
        assert_eq!(response.server_type(), ServerType::RsOther);

        response.hidden = None;
        response.secondary = None;
        response.arbiter_only = Some(true);
        assert_eq!(response.server_type(), ServerType::RsArbiter);

        response.set_name = None;
        response.arbiter_only = None;
        response.is_replica_set = Some(true);
        assert_eq!(response.server_type(), ServerType::RsGhost);
    }

    #[test]
    fn legacy_hello_is_used_until_hello_ok() {
        let cmd = hello_command(None, None, None);
        assert_eq!(cmd.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(cmd.body.get_bool("helloOk").unwrap());

        let cmd = hello_command(None, Some(true), None);
        assert_eq!(cmd.name, "hello");
        assert!(!cmd.body.contains_key("helloOk"));

        let cmd = hello_command(None, Some(false), None);
        assert_eq!(cmd.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(!cmd.body.contains_key("helloOk"));
    }

    #[test]
    fn awaitable_hello_allows_exhaust() {
        let options = AwaitableHelloOptions {
            topology_version: TopologyVersion {
                process_id: ObjectId::new(),
                counter: 1,
            },
            max_await_time: Duration::from_secs(10),
        };
        let cmd = hello_command(None, Some(true), Some(options));
        assert!(cmd.exhaust_allowed);
        assert_eq!(cmd.body.get_i64("maxAwaitTimeMS").unwrap(), 10_000);
        assert!(cmd.body.contains_key("topologyVersion"));
    }
}
