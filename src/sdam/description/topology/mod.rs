pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use serde::Serialize;

use crate::{
    bson::oid::ObjectId,
    client::session::ClusterTime,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::ReadPreference,
};

/// The possible types for a topology.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a topology.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    #[serde(skip)]
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The time that a session remains active after its most recent use. `None` when any
    /// data-bearing server doesn't report one.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The highest reported cluster time by any server in this topology.
    #[serde(skip)]
    pub(crate) cluster_time: Option<ClusterTime>,

    /// The amount of latency beyond that of the suitable server with the minimum latency that is
    /// acceptable for a read operation.
    #[serde(skip)]
    pub(crate) local_threshold: Option<Duration>,

    /// The maximum amount of time to wait before checking a given server by sending a heartbeat.
    #[serde(skip)]
    pub(crate) heartbeat_freq: Option<Duration>,

    /// In on-demand monitoring mode, set when an error invalidated the current view and the next
    /// selection attempt must rescan before trusting it.
    #[serde(skip)]
    pub(crate) stale: bool,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Equality is only used to decide whether to wake server selection waiters, so only the
        // fields consulted by server selection participate.
        self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
            && self.topology_type == other.topology_type
    }
}

impl Default for TopologyDescription {
    fn default() -> Self {
        Self {
            single_seed: false,
            topology_type: TopologyType::Unknown,
            set_name: Default::default(),
            max_set_version: Default::default(),
            max_election_id: Default::default(),
            compatibility_error: Default::default(),
            logical_session_timeout: None,
            cluster_time: Default::default(),
            local_threshold: Default::default(),
            heartbeat_freq: Default::default(),
            stale: false,
            servers: Default::default(),
        }
    }
}

impl TopologyDescription {
    pub(crate) fn initialize(&mut self, options: &ClientOptions) {
        debug_assert!(
            self.servers.is_empty() && self.topology_type == TopologyType::Unknown,
            "new TopologyDescriptions should start empty"
        );

        self.topology_type = if let Some(true) = options.direct_connection {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.load_balanced.unwrap_or(false) {
            TopologyType::LoadBalanced
        } else {
            TopologyType::Unknown
        };

        for address in options.hosts.iter() {
            let description = if self.topology_type == TopologyType::LoadBalanced {
                // Load-balanced topologies have no monitors, so the balancer is synthesized as
                // immediately selectable.
                ServerDescription::new_load_balancer(address.clone())
            } else {
                ServerDescription::new(address)
            };
            self.servers.insert(address.to_owned(), description);
        }

        self.single_seed = self.servers.len() == 1;
        self.set_name.clone_from(&options.repl_set_name);
        self.local_threshold = options.local_threshold;
        self.heartbeat_freq = options.heartbeat_freq;
    }

    /// Gets the topology type of the cluster.
    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// The read preference to attach to a command sent to the given server, per the "passing
    /// read preference to mongos and load balancers" rules of the server selection spec.
    pub(crate) fn resolve_read_preference_for_command(
        &self,
        address: &ServerAddress,
        read_preference: &ReadPreference,
    ) -> Option<ReadPreference> {
        let server_type = self
            .get_server_description(address)
            .map(|sd| sd.server_type)
            .unwrap_or(ServerType::Unknown);

        match (self.topology_type, server_type) {
            (TopologyType::Sharded, ServerType::Mongos)
            | (TopologyType::Single, ServerType::Mongos)
            | (TopologyType::LoadBalanced, _) => match read_preference {
                ReadPreference::Primary => None,
                ReadPreference::SecondaryPreferred { options } if options.is_default() => None,
                other => Some(other.clone()),
            },
            (TopologyType::Single, ServerType::Standalone) => None,
            (TopologyType::Single, _) => {
                // Direct connections to replica set members must be readable even when the
                // member isn't primary.
                let resolved = match read_preference {
                    ReadPreference::Primary => ReadPreference::PrimaryPreferred {
                        options: Default::default(),
                    },
                    other => other.clone(),
                };
                Some(resolved)
            }
            _ => match read_preference {
                ReadPreference::Primary => None,
                other => Some(other.clone()),
            },
        }
    }

    /// Gets the heartbeat frequency.
    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq
            .unwrap_or(crate::sdam::DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Check the cluster for a compatibility error, and record the error message if one is found.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;

        for server in self.servers.values() {
            let error_message = server.compatibility_error_message();

            if error_message.is_some() {
                self.compatibility_error = error_message;
                return;
            }
        }
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    /// Updates the topology's logical session timeout value based on the server's value for it.
    fn update_logical_session_timeout(&mut self, server_description: &ServerDescription) {
        if !server_description.server_type.is_data_bearing() {
            return;
        }
        match server_description.logical_session_timeout().ok().flatten() {
            Some(new_timeout) => match self.logical_session_timeout {
                Some(current_timeout) => {
                    self.logical_session_timeout =
                        Some(std::cmp::min(current_timeout, new_timeout));
                }
                None => {
                    let min_timeout = self
                        .servers
                        .values()
                        .filter(|s| s.server_type.is_data_bearing())
                        .map(|s| s.logical_session_timeout().ok().flatten())
                        .min()
                        .flatten();
                    self.logical_session_timeout = min_timeout;
                }
            },
            // If any data-bearing server has no logicalSessionTimeoutMinutes, the topology's
            // value must be unset.
            None => self.logical_session_timeout = None,
        }
    }

    /// Sets the topology's cluster time to the provided one if it is higher than the currently
    /// recorded one.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() >= Some(cluster_time) {
            return;
        }
        self.cluster_time = Some(cluster_time.clone());
    }

    /// Returns the diff between this topology description and the provided one, or `None` if
    /// they are equal.
    ///
    /// The returned `TopologyDescriptionDiff` refers to the changes reflected in the provided
    /// description. For example, a server in the provided description but not this one appears
    /// in `added_addresses`.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let other_addresses: HashSet<&ServerAddress> = other.server_addresses().collect();

        let changed_servers = self
            .servers
            .iter()
            .filter_map(|(address, description)| match other.servers.get(address) {
                Some(other_description) if description != other_description => {
                    Some((address, (description, other_description)))
                }
                _ => None,
            });

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&other_addresses).cloned().collect(),
            added_addresses: other_addresses.difference(&addresses).cloned().collect(),
            changed_servers: changed_servers.collect(),
        })
    }

    /// Update the topology based on the new information contained by the `ServerDescription`.
    pub(crate) fn update(&mut self, mut server_description: ServerDescription) -> Result<()> {
        match self.servers.get(&server_description.address) {
            None => return Ok(()),
            Some(existing_sd) => {
                // Ignore updates from outdated topology versions.
                if let (Some(existing_tv), Some(new_tv)) = (
                    existing_sd.topology_version(),
                    server_description.topology_version(),
                ) {
                    if existing_tv.process_id == new_tv.process_id
                        && new_tv.counter < existing_tv.counter
                    {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(expected_name) = &self.set_name {
            if server_description.is_available() {
                let got_name = server_description.set_name();
                if self.topology_type() == TopologyType::Single
                    && !matches!(
                        got_name.as_ref().map(|opt| opt.as_ref()),
                        Ok(Some(name)) if name == expected_name
                    )
                {
                    let got_display = match got_name {
                        Ok(Some(s)) => format!("{:?}", s),
                        Ok(None) => "<none>".to_string(),
                        Err(s) => format!("<error: {}>", s),
                    };
                    // Mark the server as unknown.
                    server_description = ServerDescription::new_from_error(
                        server_description.address,
                        Error::invalid_argument(format!(
                            "Connection string replicaSet name {:?} does not match actual name {}",
                            expected_name, got_display,
                        )),
                    );
                }
            }
        }

        // Replace the old info about the server with the new info.
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        if let TopologyType::LoadBalanced = self.topology_type {
            // Load-balanced topologies have no real server updates; a synthesized one must not
            // drive the state machine.
            return Ok(());
        }

        // Update the topology's min logicalSessionTimeout.
        self.update_logical_session_timeout(&server_description);

        // Update the topology's max reported $clusterTime.
        if let Some(ref cluster_time) = server_description.cluster_time().ok().flatten() {
            self.advance_cluster_time(cluster_time);
        }

        // Update the topology description based on the current topology type.
        match self.topology_type {
            TopologyType::Single | TopologyType::LoadBalanced => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        // Record any compatibility error.
        self.check_compatibility();

        Ok(())
    }

    /// Update the Unknown topology description based on the server description.
    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal("cannot transition to a load balancer"))
            }
        }

        Ok(())
    }

    /// Update the Sharded topology description based on the server description.
    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server description.
    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => {
                self.topology_type = TopologyType::ReplicaSetWithPrimary;
                self.update_rs_from_primary_server(server_description)?
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal("cannot transition to a load balancer"))
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the server description.
    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
            ServerType::LoadBalancer => {
                return Err(Error::internal("cannot transition to a load balancer"));
            }
        }

        Ok(())
    }

    /// Update the Unknown topology description based on the Standalone server description.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);

            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        Ok(())
    }

    /// Update the replica set topology description based on the RSPrimary server description.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();

            return Ok(());
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if let Some(server_election_id) = server_description.election_id()? {
                if let (Some(topology_max_set_version), Some(topology_max_election_id)) =
                    (self.max_set_version, self.max_election_id)
                {
                    // A primary reporting an older (setVersion, electionId) pair lost an
                    // election it hasn't noticed yet; its report cannot be trusted.
                    if topology_max_set_version > server_set_version
                        || (topology_max_set_version == server_set_version
                            && topology_max_election_id > server_election_id)
                    {
                        self.servers.insert(
                            server_description.address.clone(),
                            ServerDescription::new(&server_description.address),
                        );
                        self.record_primary_state();
                        return Ok(());
                    }
                }

                self.max_election_id = Some(server_election_id);
            }
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if self
                .max_set_version
                .map(|topology_max_set_version| server_set_version > topology_max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // If any other servers are RSPrimary, replace them with an unknown server description,
        // which will cause them to be updated by a new server check.
        for address in addresses.clone() {
            if address == server_description.address {
                continue;
            }

            if let Some(ServerType::RsPrimary) =
                self.servers.get(&address).map(|server| server.server_type)
            {
                let description = ServerDescription::new(&address);
                self.servers.insert(address, description);
            }
        }

        // The primary's member lists are authoritative: adopt additions, drop everything else.
        let known_hosts = server_description.known_hosts()?;
        self.add_new_servers(known_hosts.clone());

        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetNoPrimary if none is found.
    ///
    /// This should only be called on a replica set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Create a new ServerDescription for each address and add it to the topology.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(&address));
        }
    }
}

pub(crate) fn choose_n<T>(values: &[T], n: usize) -> impl Iterator<Item = &T> {
    use rand::{prelude::SliceRandom, SeedableRng};
    values.choose_multiple(&mut rand::rngs::SmallRng::from_entropy(), n)
}

/// A struct representing the diff between two `TopologyDescription`s.
/// Returned from `TopologyDescription::diff`.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let smallest_max_staleness = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(server_selection::IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < smallest_max_staleness {
        return Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            smallest_max_staleness.as_secs()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::hello::{HelloCommandResponse, HelloReply};

    pub(super) fn hello_description(
        address: &str,
        response: HelloCommandResponse,
    ) -> ServerDescription {
        let address = ServerAddress::parse(address).unwrap();
        let reply = HelloReply {
            server_address: address.clone(),
            command_response: response,
            raw_command_response: crate::bson::doc! {},
            cluster_time: None,
        };
        ServerDescription::new_from_hello_reply(address, reply, Duration::from_millis(5))
    }

    pub(super) fn primary_response(set_name: &str, hosts: &[&str]) -> HelloCommandResponse {
        HelloCommandResponse {
            is_writable_primary: Some(true),
            set_name: Some(set_name.to_string()),
            hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
            max_wire_version: Some(14),
            min_wire_version: Some(6),
            ..Default::default()
        }
    }

    pub(super) fn secondary_response(set_name: &str, hosts: &[&str]) -> HelloCommandResponse {
        HelloCommandResponse {
            is_writable_primary: Some(false),
            secondary: Some(true),
            set_name: Some(set_name.to_string()),
            hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
            max_wire_version: Some(14),
            min_wire_version: Some(6),
            ..Default::default()
        }
    }

    fn seeded(hosts: &[&str]) -> TopologyDescription {
        let mut description = TopologyDescription::default();
        description.initialize(
            &ClientOptions::builder()
                .hosts(
                    hosts
                        .iter()
                        .map(|h| ServerAddress::parse(h).unwrap())
                        .collect::<Vec<_>>(),
                )
                .build(),
        );
        description
    }

    #[test]
    fn primary_response_transitions_unknown_to_rs_with_primary() {
        let mut topology = seeded(&["a:27017"]);
        assert_eq!(topology.topology_type(), TopologyType::Unknown);

        topology
            .update(hello_description(
                "a:27017",
                primary_response("rs", &["a:27017", "b:27017", "c:27017"]),
            ))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.set_name.as_deref(), Some("rs"));
        // The primary's host list is adopted wholesale.
        assert_eq!(topology.servers.len(), 3);
        assert!(topology
            .servers
            .contains_key(&ServerAddress::parse("b:27017").unwrap()));
    }

    #[test]
    fn primary_with_primary_invariant_holds() {
        // type == ReplicaSetWithPrimary iff some server is RSPrimary with a matching set name.
        let mut topology = seeded(&["a:27017", "b:27017"]);

        topology
            .update(hello_description(
                "a:27017",
                primary_response("rs", &["a:27017", "b:27017"]),
            ))
            .unwrap();
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);

        // The primary failing drops the topology back to no-primary.
        topology
            .update(ServerDescription::new_from_error(
                ServerAddress::parse("a:27017").unwrap(),
                Error::network_timeout(),
            ))
            .unwrap();
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
        assert!(!topology
            .servers
            .values()
            .any(|s| s.server_type == ServerType::RsPrimary));
    }

    #[test]
    fn mongos_while_unknown_transitions_to_sharded_and_drops_others() {
        let mut topology = seeded(&["a:27017", "b:27017"]);

        let mongos = HelloCommandResponse {
            msg: Some("isdbgrid".to_string()),
            max_wire_version: Some(14),
            min_wire_version: Some(6),
            ..Default::default()
        };
        topology
            .update(hello_description("a:27017", mongos))
            .unwrap();
        assert_eq!(topology.topology_type(), TopologyType::Sharded);

        // A non-mongos response in a sharded topology removes the reporter.
        topology
            .update(hello_description(
                "b:27017",
                primary_response("rs", &["b:27017"]),
            ))
            .unwrap();
        assert!(!topology
            .servers
            .contains_key(&ServerAddress::parse("b:27017").unwrap()));
    }

    #[test]
    fn standalone_seed_transitions_to_single_only_when_single_seed() {
        let standalone = HelloCommandResponse {
            is_writable_primary: Some(true),
            max_wire_version: Some(14),
            min_wire_version: Some(6),
            ..Default::default()
        };

        let mut topology = seeded(&["a:27017"]);
        topology
            .update(hello_description("a:27017", standalone.clone()))
            .unwrap();
        assert_eq!(topology.topology_type(), TopologyType::Single);

        let mut topology = seeded(&["a:27017", "b:27017"]);
        topology
            .update(hello_description("a:27017", standalone))
            .unwrap();
        assert_eq!(topology.topology_type(), TopologyType::Unknown);
        assert!(!topology
            .servers
            .contains_key(&ServerAddress::parse("a:27017").unwrap()));
    }

    #[test]
    fn mismatched_set_name_removes_reporter() {
        let mut topology = seeded(&["a:27017", "b:27017"]);

        topology
            .update(hello_description(
                "a:27017",
                secondary_response("rs", &["a:27017", "b:27017"]),
            ))
            .unwrap();
        assert_eq!(topology.set_name.as_deref(), Some("rs"));

        topology
            .update(hello_description(
                "b:27017",
                secondary_response("other", &["b:27017"]),
            ))
            .unwrap();
        assert!(!topology
            .servers
            .contains_key(&ServerAddress::parse("b:27017").unwrap()));
    }

    #[test]
    fn stale_primary_is_coerced_to_unknown() {
        let mut topology = seeded(&["a:27017", "b:27017"]);

        let mut new_primary = primary_response("rs", &["a:27017", "b:27017"]);
        new_primary.set_version = Some(2);
        new_primary.election_id = Some(ObjectId::from_bytes([1; 12]));
        topology
            .update(hello_description("a:27017", new_primary))
            .unwrap();
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);

        // An old primary reporting a lower election id (same set version) is ignored and reset
        // to Unknown.
        let mut stale_primary = primary_response("rs", &["a:27017", "b:27017"]);
        stale_primary.set_version = Some(2);
        stale_primary.election_id = Some(ObjectId::from_bytes([0; 12]));
        topology
            .update(hello_description("b:27017", stale_primary))
            .unwrap();

        let b = topology
            .get_server_description(&ServerAddress::parse("b:27017").unwrap())
            .unwrap();
        assert_eq!(b.server_type, ServerType::Unknown);
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn new_primary_displaces_old_primary() {
        let mut topology = seeded(&["a:27017", "b:27017"]);

        topology
            .update(hello_description(
                "a:27017",
                primary_response("rs", &["a:27017", "b:27017"]),
            ))
            .unwrap();

        topology
            .update(hello_description(
                "b:27017",
                primary_response("rs", &["a:27017", "b:27017"]),
            ))
            .unwrap();

        let a = topology
            .get_server_description(&ServerAddress::parse("a:27017").unwrap())
            .unwrap();
        let b = topology
            .get_server_description(&ServerAddress::parse("b:27017").unwrap())
            .unwrap();
        assert_eq!(a.server_type, ServerType::Unknown);
        assert_eq!(b.server_type, ServerType::RsPrimary);
    }

    #[test]
    fn logical_session_timeout_is_minimum_across_data_bearing() {
        let mut topology = seeded(&["a:27017", "b:27017"]);

        let mut primary = primary_response("rs", &["a:27017", "b:27017"]);
        primary.logical_session_timeout_minutes = Some(30);
        topology
            .update(hello_description("a:27017", primary))
            .unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(30 * 60))
        );

        let mut secondary = secondary_response("rs", &["a:27017", "b:27017"]);
        secondary.logical_session_timeout_minutes = Some(10);
        topology
            .update(hello_description("b:27017", secondary))
            .unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(10 * 60))
        );
    }

    #[test]
    fn compatibility_error_is_set_for_old_servers() {
        let mut topology = seeded(&["a:27017"]);

        let old = HelloCommandResponse {
            is_writable_primary: Some(true),
            max_wire_version: Some(4),
            min_wire_version: Some(2),
            ..Default::default()
        };
        topology.update(hello_description("a:27017", old)).unwrap();
        assert!(topology.compatibility_error().is_some());
    }

    #[test]
    fn cluster_time_is_monotone_across_updates() {
        use crate::client::session::ClusterTime;

        let mut topology = seeded(&["a:27017", "b:27017"]);

        let address = ServerAddress::parse("a:27017").unwrap();
        let mut reply = crate::hello::HelloReply {
            server_address: address.clone(),
            command_response: primary_response("rs", &["a:27017", "b:27017"]),
            raw_command_response: crate::bson::doc! {},
            cluster_time: Some(ClusterTime::new_testing(2, 1)),
        };
        topology
            .update(ServerDescription::new_from_hello_reply(
                address.clone(),
                reply.clone(),
                Duration::from_millis(1),
            ))
            .unwrap();
        assert_eq!(
            topology.cluster_time(),
            Some(&ClusterTime::new_testing(2, 1))
        );

        // An older cluster time from another server must not regress the topology's.
        reply.cluster_time = Some(ClusterTime::new_testing(1, 9));
        reply.server_address = ServerAddress::parse("b:27017").unwrap();
        reply.command_response = secondary_response("rs", &["a:27017", "b:27017"]);
        topology
            .update(ServerDescription::new_from_hello_reply(
                reply.server_address.clone(),
                reply.clone(),
                Duration::from_millis(1),
            ))
            .unwrap();
        assert_eq!(
            topology.cluster_time(),
            Some(&ClusterTime::new_testing(2, 1))
        );

        // A newer one advances it.
        reply.cluster_time = Some(ClusterTime::new_testing(3, 1));
        topology
            .update(ServerDescription::new_from_hello_reply(
                reply.server_address.clone(),
                reply,
                Duration::from_millis(1),
            ))
            .unwrap();
        assert_eq!(
            topology.cluster_time(),
            Some(&ClusterTime::new_testing(3, 1))
        );
    }

    #[test]
    fn max_staleness_floor_is_enforced() {
        assert!(verify_max_staleness(
            Duration::from_secs(89),
            Duration::from_secs(10)
        )
        .is_err());
        assert!(verify_max_staleness(
            Duration::from_secs(120),
            Duration::from_secs(10)
        )
        .is_ok());
    }
}
