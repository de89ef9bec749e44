use std::{collections::HashMap, fmt, ops::Deref, sync::Arc, time::Duration};

use super::{TopologyDescription, TopologyType};
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::server::{ServerDescription, ServerType},
        public::ServerInfo,
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Struct encapsulating a selected server that handles the operation count accounting.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    pub(crate) fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

/// Attempt to select a server, returning `None` if no server matched the provided criteria.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &'a SelectionCriteria,
    topology_description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    deprioritized: Option<&ServerAddress>,
) -> Result<Option<SelectedServer>> {
    let mut in_window = topology_description.suitable_servers_in_latency_window(criteria)?;
    if let Some(addr) = deprioritized {
        // Retries deprioritize the server that just failed, unless it's the only candidate.
        if in_window.len() > 1 {
            in_window.retain(|d| &d.address != addr);
        }
    }
    let in_window_servers = in_window
        .into_iter()
        .flat_map(|desc| servers.get(&desc.address))
        .collect();
    let selected = select_server_in_latency_window(in_window_servers);
    Ok(selected.map(SelectedServer::new))
}

/// Choose a server from several suitable choices within the latency window according to the
/// algorithm laid out in the server selection specification: pick two at random and prefer the
/// less loaded one.
fn select_server_in_latency_window(in_window: Vec<&Arc<Server>>) -> Option<Arc<Server>> {
    if in_window.is_empty() {
        return None;
    } else if in_window.len() == 1 {
        return Some(in_window[0].clone());
    }

    #[cfg(test)]
    if deterministic_selection() {
        // Tie-break by address so selection-dependent tests are reproducible.
        return in_window
            .into_iter()
            .min_by_key(|s| s.address.to_string())
            .cloned();
    }

    super::choose_n(&in_window, 2)
        .min_by_key(|s| s.operation_count())
        .map(|server| (*server).clone())
}

#[cfg(test)]
fn deterministic_selection() -> bool {
    true
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|s| {
                    // For direct connections ignore whether the single server is data-bearing.
                    (self.topology_type == TopologyType::Single || s.server_type.is_data_bearing())
                        && filter(&ServerInfo::new_borrowed(s))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    fn suitable_servers(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(&self, suitable_servers: &mut Vec<&ServerDescription>) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .fold(Option::<Duration>::None, |min, curr| match min {
                Some(prev) => Some(prev.min(curr)),
                None => Some(curr),
            });

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // Load balancers are never monitored and have no RTT; they are always kept.
                _ => matches!(server_desc.server_type, ServerType::LoadBalancer),
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let tag_sets = read_preference.tag_sets();
        let max_staleness = read_preference.max_staleness();

        let servers = match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
            ReadPreference::PrimaryPreferred { .. } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_for_read_preference(
                        &[ServerType::RsSecondary],
                        tag_sets,
                        max_staleness,
                    )?,
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets,
                    max_staleness,
                )?;

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { .. } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets,
                max_staleness,
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference(
        &self,
        types: &'static [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = max_staleness {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
        }

        let mut servers = self.servers_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // According to the spec, max staleness <= 0 is the same as no max staleness.
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let primary = self
            .servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                self.filter_servers_by_max_staleness_with_primary(servers, primary, max_staleness)
            }
            None => self.filter_servers_by_max_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_servers_by_max_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let max_staleness_ms: i64 = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);

        servers.retain(|server| {
            let server_staleness = self.calculate_secondary_staleness_with_primary(server, primary);

            server_staleness
                .map(|staleness| staleness <= max_staleness_ms)
                .unwrap_or(false)
        })
    }

    fn filter_servers_by_max_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness: i64 = max_staleness.as_millis().try_into().unwrap_or(i64::MAX);
        let max_write_date = self
            .servers
            .values()
            .filter(|server| server.server_type == ServerType::RsSecondary)
            .filter_map(|server| server.last_write_date().ok().flatten())
            .map(|last_write_date| last_write_date.timestamp_millis())
            .max();

        let secondary_max_write_date = match max_write_date {
            Some(max_write_date) => max_write_date,
            None => return,
        };

        servers.retain(|server| {
            let server_staleness = self
                .calculate_secondary_staleness_without_primary(server, secondary_max_write_date);

            server_staleness
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }

    fn calculate_secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date().ok()??.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();

        let heartbeat_frequency: i64 = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = (secondary_last_update - secondary_last_write)
            - (primary_last_update - primary_last_write)
            + heartbeat_frequency;

        Some(staleness)
    }

    fn calculate_secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();
        let heartbeat_frequency: i64 = self
            .heartbeat_frequency()
            .as_millis()
            .try_into()
            .unwrap_or(i64::MAX);

        let staleness = max_last_write_date - secondary_last_write + heartbeat_frequency;
        Some(staleness)
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }

        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", max_set_version)?;
        }

        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", max_election_id)?;
        }

        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", compatibility_error)?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut iter = self.servers.values();
            if let Some(server) = iter.next() {
                write!(f, "{}", ServerInfo::new_borrowed(server))?;
            }
            for server in iter {
                write!(f, ", {}", ServerInfo::new_borrowed(server))?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// Tag sets are applied in order; the first one matching at least one server wins, and an empty
/// tag set matches everything.
fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);

            return;
        }
    }

    servers.clear();
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::super::test::{hello_description, primary_response, secondary_response};
    use super::*;
    use crate::{
        bson::DateTime,
        hello::{HelloCommandResponse, LastWrite},
        options::ClientOptions,
        selection_criteria::ReadPreferenceOptions,
    };

    fn replica_set() -> TopologyDescription {
        let mut topology = TopologyDescription::default();
        topology.initialize(
            &ClientOptions::builder()
                .hosts(vec![
                    ServerAddress::parse("a:27017").unwrap(),
                    ServerAddress::parse("b:27017").unwrap(),
                    ServerAddress::parse("c:27017").unwrap(),
                ])
                .build(),
        );

        let hosts = &["a:27017", "b:27017", "c:27017"];
        topology
            .update(hello_description("a:27017", primary_response("rs", hosts)))
            .unwrap();
        topology
            .update(hello_description(
                "b:27017",
                secondary_response("rs", hosts),
            ))
            .unwrap();
        topology
            .update(hello_description(
                "c:27017",
                secondary_response("rs", hosts),
            ))
            .unwrap();
        topology
    }

    fn suitable_addresses(
        topology: &TopologyDescription,
        read_pref: ReadPreference,
    ) -> Vec<String> {
        let criteria = SelectionCriteria::ReadPreference(read_pref);
        let mut addresses: Vec<String> = topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .into_iter()
            .map(|s| s.address.to_string())
            .collect();
        addresses.sort();
        addresses
    }

    #[test]
    fn primary_mode_selects_only_the_primary() {
        let topology = replica_set();
        assert_eq!(
            suitable_addresses(&topology, ReadPreference::Primary),
            vec!["a:27017"]
        );
    }

    #[test]
    fn secondary_mode_excludes_the_primary() {
        let topology = replica_set();
        assert_eq!(
            suitable_addresses(
                &topology,
                ReadPreference::Secondary {
                    options: Default::default()
                }
            ),
            vec!["b:27017", "c:27017"]
        );
    }

    #[test]
    fn nearest_includes_all_data_bearing() {
        let topology = replica_set();
        assert_eq!(
            suitable_addresses(
                &topology,
                ReadPreference::Nearest {
                    options: Default::default()
                }
            ),
            vec!["a:27017", "b:27017", "c:27017"]
        );
    }

    #[test]
    fn primary_preferred_falls_back_to_secondaries() {
        let mut topology = replica_set();
        topology
            .update(crate::sdam::description::server::ServerDescription::new_from_error(
                ServerAddress::parse("a:27017").unwrap(),
                crate::error::Error::network_timeout(),
            ))
            .unwrap();

        assert_eq!(
            suitable_addresses(
                &topology,
                ReadPreference::PrimaryPreferred {
                    options: Default::default()
                }
            ),
            vec!["b:27017", "c:27017"]
        );
    }

    #[test]
    fn first_matching_tag_set_wins() {
        let mut topology = replica_set();

        // Tag b as "east" and c as "west".
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let mut tagged = secondary_response("rs", hosts);
        tagged.tags = Some([("dc".to_string(), "east".to_string())].into());
        topology
            .update(hello_description("b:27017", tagged))
            .unwrap();
        let mut tagged = secondary_response("rs", hosts);
        tagged.tags = Some([("dc".to_string(), "west".to_string())].into());
        topology
            .update(hello_description("c:27017", tagged))
            .unwrap();

        let read_pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                tag_sets: Some(vec![
                    [("dc".to_string(), "north".to_string())].into(),
                    [("dc".to_string(), "west".to_string())].into(),
                    [("dc".to_string(), "east".to_string())].into(),
                ]),
                ..Default::default()
            },
        };

        // "north" matches nothing, so "west" is the first set that matches at least one server.
        assert_eq!(suitable_addresses(&topology, read_pref), vec!["c:27017"]);
    }

    #[test]
    fn empty_tag_set_matches_everything() {
        let topology = replica_set();
        let read_pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                tag_sets: Some(vec![TagSet::new()]),
                ..Default::default()
            },
        };
        assert_eq!(
            suitable_addresses(&topology, read_pref),
            vec!["b:27017", "c:27017"]
        );
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let mut topology = replica_set();

        // Give c an RTT far outside the 15ms default window relative to a and b.
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let slow = hello_description("c:27017", secondary_response("rs", hosts));
        let mut slow = slow;
        slow.average_round_trip_time = Some(Duration::from_millis(500));
        topology.update(slow).unwrap();

        assert_eq!(
            suitable_addresses(
                &topology,
                ReadPreference::Nearest {
                    options: Default::default()
                }
            ),
            vec!["a:27017", "b:27017"]
        );
    }

    #[test]
    fn max_staleness_filters_lagging_secondaries() {
        let mut topology = replica_set();
        topology.heartbeat_freq = Some(Duration::from_secs(10));

        let now = DateTime::now();
        let hosts = &["a:27017", "b:27017", "c:27017"];

        let mut primary = primary_response("rs", hosts);
        primary.last_write = Some(LastWrite {
            last_write_date: now,
        });
        topology
            .update(hello_description("a:27017", primary))
            .unwrap();

        let mut fresh = secondary_response("rs", hosts);
        fresh.last_write = Some(LastWrite {
            last_write_date: now,
        });
        topology
            .update(hello_description("b:27017", fresh))
            .unwrap();

        let mut stale = secondary_response("rs", hosts);
        stale.last_write = Some(LastWrite {
            last_write_date: DateTime::from_millis(now.timestamp_millis() - 600_000),
        });
        topology
            .update(hello_description("c:27017", stale))
            .unwrap();

        let read_pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                max_staleness: Some(Duration::from_secs(120)),
                ..Default::default()
            },
        };

        assert_eq!(suitable_addresses(&topology, read_pref), vec!["b:27017"]);
    }

    #[test]
    fn max_staleness_below_floor_is_rejected() {
        let topology = replica_set();
        let read_pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                max_staleness: Some(Duration::from_secs(1)),
                ..Default::default()
            },
        };
        let criteria = SelectionCriteria::ReadPreference(read_pref);
        assert!(topology.suitable_servers_in_latency_window(&criteria).is_err());
    }

    #[test]
    fn compatibility_error_fails_selection_immediately() {
        let mut topology = replica_set();
        let old = HelloCommandResponse {
            is_writable_primary: Some(true),
            set_name: Some("rs".to_string()),
            hosts: Some(vec![
                "a:27017".to_string(),
                "b:27017".to_string(),
                "c:27017".to_string(),
            ]),
            max_wire_version: Some(4),
            min_wire_version: Some(2),
            ..Default::default()
        };
        topology.update(hello_description("a:27017", old)).unwrap();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let err = topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap_err();
        assert!(err.is_incompatible_server());
    }

    #[test]
    fn unknown_topology_yields_no_candidates() {
        let mut topology = TopologyDescription::default();
        topology.initialize(
            &ClientOptions::builder()
                .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
                .build(),
        );

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        assert!(topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .is_empty());
    }
}
