pub(crate) mod description;
mod monitor;
pub mod public;
mod server;
mod topology;

use std::time::Duration;

pub(crate) use self::{
    description::{server::TopologyVersion, topology::TopologyDescription},
    server::Server,
    topology::{HandshakePhase, Topology, TopologyUpdater, TopologyWatcher},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The minimum wait after a failed check of a server that isn't a replica-set member before it
/// may be checked again, regardless of selection pressure.
pub(crate) const COOLDOWN: Duration = Duration::from_secs(5);
