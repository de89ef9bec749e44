//! Contains the events and functionality for monitoring server discovery and monitoring.

use std::time::Duration;

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    options::ServerAddress,
    sdam::public::{ServerInfo, TopologyType},
};

/// A public, read-only view of a topology description, as exposed through SDAM events.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    pub(crate) description: crate::sdam::TopologyDescription,
}

impl From<crate::sdam::TopologyDescription> for TopologyDescription {
    fn from(description: crate::sdam::TopologyDescription) -> Self {
        Self { description }
    }
}

impl TopologyDescription {
    /// The type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.description.topology_type()
    }

    /// The replica set name of the topology, if any.
    pub fn set_name(&self) -> Option<&str> {
        self.description.set_name.as_deref()
    }

    /// The error describing a wire version incompatibility between the driver and deployment,
    /// if any.
    pub fn compatibility_error(&self) -> Option<&str> {
        self.description.compatibility_error.as_deref()
    }

    /// Views of the servers in the topology.
    pub fn servers(&self) -> Vec<ServerInfo<'_>> {
        self.description
            .servers
            .values()
            .map(ServerInfo::new_borrowed)
            .collect()
    }
}

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology's description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is closed. This is the last SDAM event a topology emits.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is added to a topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The address of the server.
    pub address: ServerAddress,
}

/// Published when a server is removed from a topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The address of the server.
    pub address: ServerAddress,
}

/// Published when a server monitor sends a `hello` probe.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a server monitor's `hello` probe succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The duration of the probe, which feeds the server's round trip time average.
    pub duration: Duration,

    /// The server's reply, with any speculative authentication payload removed.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Published when a server monitor's `hello` probe fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The duration of the failed probe.
    pub duration: Duration,

    /// The error that caused the probe to fail.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event sent
/// by the driver.
///
/// Handlers are invoked synchronously (from monitor tasks and the topology worker) and must not
/// block.
pub trait SdamEventHandler: Send + Sync {
    /// A `Client` will call this method on each registered handler whenever a topology is
    /// initialized.
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// A `Client` will call this method on each registered handler whenever its topology
    /// description changes.
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a topology is
    /// closed.
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a server is added to
    /// a topology.
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// A `Client` will call this method on each registered handler whenever a server is removed
    /// from a topology.
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a heartbeat is
    /// started.
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// A `Client` will call this method on each registered handler whenever a heartbeat
    /// succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// A `Client` will call this method on each registered handler whenever a heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}
