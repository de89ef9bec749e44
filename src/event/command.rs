//! Contains the events and functionality to monitor the commands and responses that a `Client`
//! sends and receives from the server.

use std::time::Duration;

use crate::{bson::Document, cmap::ConnectionInfo, error::Error};

/// An event that triggers when a database command is initiated.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command being run.
    pub command: Document,

    /// The name of the database the command is being run against.
    pub db: String,

    /// The type of command being run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request. Applications can use this to identify
    /// the corresponding [`CommandSucceededEvent`] or [`CommandFailedEvent`].
    pub request_id: i32,

    /// A driver-generated identifier that ties together the events of one logical operation,
    /// across retries and cursor batches.
    pub operation_id: i32,

    /// Information about the connection the command will be run on.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a database command completes without an error.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The server's reply to the command.
    pub reply: Document,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// The identifier of the logical operation this command belongs to.
    pub operation_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,
}

/// An event that triggers when a command failed to complete successfully.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The error that the driver returned due to the event failing.
    pub failure: Error,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// The identifier of the logical operation this command belongs to.
    pub operation_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,
}

/// Applications can implement this trait to specify custom logic to run on each command event
/// sent by the driver.
///
/// Handlers are invoked synchronously from the task executing the command, so they must not
/// block.
pub trait CommandEventHandler: Send + Sync {
    /// A `Client` will call this method on each registered handler whenever a database command is
    /// initiated.
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a database command
    /// successfully completes.
    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}

    /// A `Client` will call this method on each registered handler whenever a database command
    /// fails to complete successfully.
    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}
