use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot, watch, Notify};

use super::{
    description::{
        server::ServerDescription,
        topology::{
            server_selection::{attempt_to_select_server, SelectedServer},
            TopologyDescription, TopologyType,
        },
    },
    monitor::Monitor,
    server::Server,
    MIN_HEARTBEAT_FREQUENCY,
};
use crate::{
    bson::oid::ObjectId,
    client::session::ClusterTime,
    cmap::{
        establish::ConnectionEstablisher, options::ConnectionPoolOptions, Connection,
        ConnectionPool,
    },
    error::{Error, ErrorKind, Result},
    event::sdam::{
        SdamEventHandler, ServerClosedEvent, ServerOpeningEvent, TopologyClosedEvent,
        TopologyDescriptionChangedEvent, TopologyOpeningEvent,
    },
    hello::{hello_command, run_hello},
    options::{ClientOptions, MonitoringMode, ServerAddress},
    runtime,
    selection_criteria::SelectionCriteria,
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The snapshot of the topology published to selection and execution: the logical description
/// plus the live per-server state (pools).
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The driver's view of the deployment it is connected to. Owns the background worker that
/// serializes all updates to the topology description, the monitors feeding it, and the
/// per-server connection pools.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: Arc<Notify>,
    options: ClientOptions,
    scanner: tokio::sync::Mutex<Scanner>,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let establisher = ConnectionEstablisher::new(&options)?;
        let monitor_establisher = ConnectionEstablisher::for_monitoring(&options)?;

        let id = ObjectId::new();
        if let Some(ref handler) = options.sdam_event_handler {
            handler.handle_topology_opening_event(TopologyOpeningEvent { topology_id: id });
        }

        let mut description = TopologyDescription::default();
        description.initialize(&options);

        let check_requester = Arc::new(Notify::new());

        let mut servers = HashMap::new();
        for address in description.server_addresses() {
            servers.insert(
                address.clone(),
                Arc::new(Server::new(
                    address.clone(),
                    ConnectionPool::new(
                        address.clone(),
                        establisher.clone(),
                        options.cmap_event_handler.clone(),
                        ConnectionPoolOptions::from_client_options(&options),
                    ),
                )),
            );
            if let Some(ref handler) = options.sdam_event_handler {
                handler.handle_server_opening_event(ServerOpeningEvent {
                    topology_id: id,
                    address: address.clone(),
                });
            }
        }

        let state = TopologyState {
            description,
            servers,
        };

        let (watch_sender, watch_receiver) = watch::channel(Arc::new(state.clone()));
        let (update_sender, update_receiver) = mpsc::unbounded_channel();

        let watcher = TopologyWatcher {
            receiver: watch_receiver,
        };
        let updater = TopologyUpdater {
            sender: update_sender,
        };

        let worker = TopologyWorker {
            id,
            state,
            publisher: watch_sender,
            update_receiver,
            establisher,
            monitor_establisher: monitor_establisher.clone(),
            check_requester: check_requester.clone(),
            options: options.clone(),
            watcher: watcher.clone(),
            updater: updater.clone(),
        };

        worker.start();

        Ok(Topology {
            watcher,
            updater,
            check_requester,
            scanner: tokio::sync::Mutex::new(Scanner {
                establisher: monitor_establisher,
                entries: HashMap::new(),
            }),
            options,
        })
    }

    pub(crate) fn watcher(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .peek_latest()
            .description
            .cluster_time()
            .cloned()
    }

    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        self.updater.advance_cluster_time(cluster_time).await;
    }

    /// Signals the monitors that a selection attempt came up empty and an immediate recheck is
    /// wanted.
    pub(crate) fn request_update(&self) {
        self.check_requester.notify_waiters();
    }

    /// Selects a server according to the given criteria, waiting for topology updates (or, in
    /// on-demand mode, driving scans) until the selection deadline passes.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        operation_name: &str,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let timeout = self
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let deadline = Instant::now() + timeout;

        match self.options.monitoring_mode() {
            MonitoringMode::Background => {
                self.select_server_monitored(criteria, operation_name, deprioritized, deadline)
                    .await
            }
            MonitoringMode::OnDemand => {
                self.select_server_on_demand(criteria, operation_name, deprioritized, deadline)
                    .await
            }
        }
    }

    async fn select_server_monitored(
        &self,
        criteria: &SelectionCriteria,
        operation_name: &str,
        deprioritized: Option<&ServerAddress>,
        deadline: Instant,
    ) -> Result<SelectedServer> {
        let mut watcher = self.watcher.clone();

        loop {
            if !watcher.is_alive() {
                return Err(ErrorKind::Shutdown.into());
            }

            let state = watcher.observe_latest();

            if let Some(server) = attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
                deprioritized,
            )? {
                tracing::debug!(
                    operation = operation_name,
                    server = %server.address,
                    "selected server"
                );
                return Ok(server);
            }

            self.request_update();

            if !watcher.wait_for_update(deadline).await {
                if !watcher.is_alive() {
                    return Err(ErrorKind::Shutdown.into());
                }
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    async fn select_server_on_demand(
        &self,
        criteria: &SelectionCriteria,
        operation_name: &str,
        deprioritized: Option<&ServerAddress>,
        deadline: Instant,
    ) -> Result<SelectedServer> {
        let try_once = self.options.server_selection_try_once.unwrap_or(true);
        let mut watcher = self.watcher.clone();

        loop {
            // A view invalidated by an error, or one with no live servers, warrants an immediate
            // rescan (rate-limited per server); otherwise servers are only re-checked on the
            // normal heartbeat cadence.
            let latest = watcher.peek_latest();
            let force = latest.description.stale || !latest.description.has_available_servers();
            drop(latest);
            self.scan(force).await;

            let state = watcher.observe_latest();

            if let Some(server) = attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
                deprioritized,
            )? {
                tracing::debug!(
                    operation = operation_name,
                    server = %server.address,
                    "selected server"
                );
                return Ok(server);
            }

            if try_once {
                return Err(ErrorKind::ServerSelection {
                    message: format!(
                        "serverSelectionTryOnce is set and a single topology scan did not yield \
                         a suitable server. {}",
                        state
                            .description
                            .server_selection_timeout_error_message(criteria)
                    ),
                }
                .into());
            }

            if Instant::now() + MIN_HEARTBEAT_FREQUENCY >= deadline {
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }

            runtime::delay_for(MIN_HEARTBEAT_FREQUENCY).await;
        }
    }

    /// Checks every server in the topology that is due for a check, feeding the results through
    /// the topology worker. Newly discovered hosts are checked in the same pass.
    async fn scan(&self, force: bool) {
        let mut scanner = self.scanner.lock().await;
        scanner
            .scan(&self.watcher, &self.updater, &self.options, force)
            .await;
    }

    /// Shuts down the topology worker and, transitively, all monitors.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

/// A handle for observing topology snapshots as they are published.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<Arc<TopologyState>>,
}

impl TopologyWatcher {
    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// The latest snapshot, marking it as seen for `wait_for_update` purposes.
    pub(crate) fn observe_latest(&mut self) -> Arc<TopologyState> {
        self.receiver.borrow_and_update().clone()
    }

    /// The latest snapshot without consuming the change notification.
    pub(crate) fn peek_latest(&self) -> Arc<TopologyState> {
        self.receiver.borrow().clone()
    }

    pub(crate) fn server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Waits until a new snapshot is published or the deadline passes; returns whether an update
    /// arrived.
    pub(crate) async fn wait_for_update(&mut self, deadline: Instant) -> bool {
        matches!(
            runtime::timeout_at(deadline, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

/// A handle for feeding updates into the topology worker.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<UpdateMessage>,
}

impl TopologyUpdater {
    /// Applies a fresh server description, returning whether the topology changed.
    pub(crate) async fn update(&self, description: ServerDescription) -> bool {
        let (ack, rx) = oneshot::channel();
        let _ = self.sender.send(UpdateMessage::ServerUpdate {
            description: Box::new(description),
            ack,
        });
        rx.await.unwrap_or(false)
    }

    /// Handles the failure of a monitor check: mark the server Unknown and clear its pool,
    /// exactly once per transition.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        let (ack, rx) = oneshot::channel();
        let _ = self.sender.send(UpdateMessage::MonitorError {
            address,
            error,
            ack,
        });
        rx.await.unwrap_or(false)
    }

    /// Handles an error from application traffic against a server.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let (ack, rx) = oneshot::channel();
        let _ = self.sender.send(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
            ack,
        });
        rx.await.unwrap_or(false)
    }

    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        let _ = self
            .sender
            .send(UpdateMessage::AdvanceClusterTime(cluster_time));
    }

    pub(crate) async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        let _ = self.sender.send(UpdateMessage::Shutdown(ack));
        let _ = rx.await;
    }
}

/// Where in a connection's lifecycle an application error surfaced, with the pool generation
/// observed by the failing operation so that stale reports are discarded.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// The error occurred before the connection's handshake completed.
    BeforeCompletion { generation: u32 },

    /// The error occurred on an established connection.
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    fn generation(&self) -> u32 {
        match self {
            Self::BeforeCompletion { generation } => *generation,
            Self::AfterCompletion { generation, .. } => *generation,
        }
    }

    fn wire_version(&self) -> Option<i32> {
        match self {
            Self::BeforeCompletion { .. } => None,
            Self::AfterCompletion {
                max_wire_version, ..
            } => Some(*max_wire_version),
        }
    }

    fn is_before_completion(&self) -> bool {
        matches!(self, Self::BeforeCompletion { .. })
    }
}

enum UpdateMessage {
    ServerUpdate {
        description: Box<ServerDescription>,
        ack: oneshot::Sender<bool>,
    },
    MonitorError {
        address: ServerAddress,
        error: Error,
        ack: oneshot::Sender<bool>,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
        ack: oneshot::Sender<bool>,
    },
    AdvanceClusterTime(ClusterTime),
    Shutdown(oneshot::Sender<()>),
}

/// The task that owns the topology state. All mutations are serialized through its message
/// queue; each one that changes the topology publishes a fresh immutable snapshot.
struct TopologyWorker {
    id: ObjectId,
    state: TopologyState,
    publisher: watch::Sender<Arc<TopologyState>>,
    update_receiver: mpsc::UnboundedReceiver<UpdateMessage>,
    establisher: ConnectionEstablisher,
    monitor_establisher: ConnectionEstablisher,
    check_requester: Arc<Notify>,
    options: ClientOptions,

    // Handles passed to monitors spawned by this worker.
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
}

impl TopologyWorker {
    fn start(mut self) {
        if self.options.monitoring_mode() == MonitoringMode::Background
            && self.state.description.topology_type() != TopologyType::LoadBalanced
        {
            for address in self.state.servers.keys() {
                self.spawn_monitor(address.clone());
            }
        }

        runtime::spawn(async move {
            while let Some(message) = self.update_receiver.recv().await {
                match message {
                    UpdateMessage::ServerUpdate { description, ack } => {
                        let changed = self.apply_update(*description).await;
                        let _ = ack.send(changed);
                    }
                    UpdateMessage::MonitorError {
                        address,
                        error,
                        ack,
                    } => {
                        let changed = self.handle_monitor_error(address, error).await;
                        let _ = ack.send(changed);
                    }
                    UpdateMessage::ApplicationError {
                        address,
                        error,
                        phase,
                        ack,
                    } => {
                        let changed = self.handle_application_error(address, error, phase).await;
                        let _ = ack.send(changed);
                    }
                    UpdateMessage::AdvanceClusterTime(cluster_time) => {
                        self.state.description.advance_cluster_time(&cluster_time);
                        self.publish();
                    }
                    UpdateMessage::Shutdown(ack) => {
                        let _ = ack.send(());
                        break;
                    }
                }
            }

            if let Some(ref handler) = self.options.sdam_event_handler {
                for address in self.state.servers.keys() {
                    handler.handle_server_closed_event(ServerClosedEvent {
                        topology_id: self.id,
                        address: address.clone(),
                    });
                }
                handler.handle_topology_closed_event(TopologyClosedEvent {
                    topology_id: self.id,
                });
            }
        });
    }

    /// Applies a server description through the SDAM state machine, syncing monitors and pools
    /// with the resulting membership. Returns whether the topology changed.
    async fn apply_update(&mut self, description: ServerDescription) -> bool {
        let server_available = description.is_available();
        let address = description.address.clone();
        let previous = self.state.description.clone();

        if let Err(err) = self.state.description.update(description) {
            tracing::warn!(error = %err, "rejected invalid topology transition");
            return false;
        }

        self.sync_servers();

        // A server confirmed alive un-pauses its pool, and in on-demand mode refreshes a view
        // an error had invalidated.
        if server_available {
            if let Some(server) = self.state.servers.get(&address) {
                server.pool.mark_as_ready();
            }
            self.state.description.stale = false;
        }

        self.publish_if_changed(&previous)
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        let was_available = self
            .state
            .description
            .get_server_description(&address)
            .map(|sd| sd.is_available())
            .unwrap_or(false);

        let changed = {
            let previous = self.state.description.clone();
            let unknown = ServerDescription::new_from_error(address.clone(), error.clone());
            if self.state.description.update(unknown).is_err() {
                return false;
            }
            self.sync_servers();
            self.mark_stale();
            self.publish_if_changed(&previous)
        };

        // The pool generation is bumped exactly once per transition to Unknown; repeated monitor
        // failures on an already-unknown server leave the generation alone.
        if changed && was_available {
            if let Some(server) = self.state.servers.get(&address) {
                server.pool.clear(error, None);
            }
        }

        changed
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.state.servers.get(&address) {
            Some(server) => server.clone(),
            None => return false,
        };

        // An error observed under an older pool generation was already acted upon.
        if phase.generation() != server.pool.generation() {
            return false;
        }

        let load_balanced =
            self.state.description.topology_type() == TopologyType::LoadBalanced;

        if error.is_state_change_error() {
            let updated =
                load_balanced || self.mark_server_as_unknown(&address, error.clone()).await;

            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(error, None);
            }
            self.check_requester.notify_waiters();

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion()
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated =
                load_balanced || self.mark_server_as_unknown(&address, error.clone()).await;
            if updated {
                server.pool.clear(error, None);
                self.check_requester.notify_waiters();
            }
            updated
        } else {
            false
        }
    }

    async fn mark_server_as_unknown(&mut self, address: &ServerAddress, error: Error) -> bool {
        let previous = self.state.description.clone();
        let unknown = ServerDescription::new_from_error(address.clone(), error);
        if self.state.description.update(unknown).is_err() {
            return false;
        }
        self.sync_servers();
        self.mark_stale();
        self.publish_if_changed(&previous)
    }

    /// In on-demand monitoring mode an error-driven update means the next selection attempt must
    /// rescan before trusting the description.
    fn mark_stale(&mut self) {
        if self.options.monitoring_mode() == MonitoringMode::OnDemand {
            self.state.description.stale = true;
        }
    }

    /// Brings the live server set (pools, monitors) in line with the description's membership.
    fn sync_servers(&mut self) {
        let description_addresses: Vec<ServerAddress> = self
            .state
            .description
            .server_addresses()
            .cloned()
            .collect();

        for address in &description_addresses {
            if !self.state.servers.contains_key(address) {
                self.state.servers.insert(
                    address.clone(),
                    Arc::new(Server::new(
                        address.clone(),
                        ConnectionPool::new(
                            address.clone(),
                            self.establisher.clone(),
                            self.options.cmap_event_handler.clone(),
                            ConnectionPoolOptions::from_client_options(&self.options),
                        ),
                    )),
                );

                if let Some(ref handler) = self.options.sdam_event_handler {
                    handler.handle_server_opening_event(ServerOpeningEvent {
                        topology_id: self.id,
                        address: address.clone(),
                    });
                }

                if self.options.monitoring_mode() == MonitoringMode::Background {
                    self.spawn_monitor(address.clone());
                }
            }
        }

        let removed: Vec<ServerAddress> = self
            .state
            .servers
            .keys()
            .filter(|address| !description_addresses.contains(address))
            .cloned()
            .collect();

        for address in removed {
            self.state.servers.remove(&address);
            if let Some(ref handler) = self.options.sdam_event_handler {
                handler.handle_server_closed_event(ServerClosedEvent {
                    topology_id: self.id,
                    address,
                });
            }
        }
    }

    fn spawn_monitor(&self, address: ServerAddress) {
        Monitor::start(
            address,
            self.updater.clone(),
            self.watcher.clone(),
            self.check_requester.clone(),
            self.monitor_establisher.clone(),
            self.options.clone(),
        );
    }

    fn publish_if_changed(&mut self, previous: &TopologyDescription) -> bool {
        let changed = previous.diff(&self.state.description).is_some();
        if changed {
            if let Some(ref handler) = self.options.sdam_event_handler {
                handler.handle_topology_description_changed_event(
                    TopologyDescriptionChangedEvent {
                        topology_id: self.id,
                        previous_description: previous.clone().into(),
                        new_description: self.state.description.clone().into(),
                    },
                );
            }
            self.publish();
        } else {
            // Servers waiting in selection still need fresh RTT data and the like.
            self.publish();
        }
        changed
    }

    fn publish(&mut self) {
        let _ = self.publisher.send(Arc::new(self.state.clone()));
    }
}

/// Drives on-demand topology scans: one cached monitoring connection per server, checked no more
/// often than the minimum heartbeat interval, with the full cooldown after failures.
#[derive(Debug)]
struct Scanner {
    establisher: ConnectionEstablisher,
    entries: HashMap<ServerAddress, ScanEntry>,
}

#[derive(Debug, Default)]
struct ScanEntry {
    connection: Option<Connection>,
    last_check: Option<Instant>,
    last_failed: bool,
}

impl Scanner {
    async fn scan(
        &mut self,
        watcher: &TopologyWatcher,
        updater: &TopologyUpdater,
        options: &ClientOptions,
        force: bool,
    ) {
        let establisher = self.establisher.clone();
        let mut checked: Vec<ServerAddress> = Vec::new();

        // Servers discovered during the scan are themselves checked before the scan finishes.
        loop {
            let addresses: Vec<ServerAddress> = watcher
                .peek_latest()
                .description
                .server_addresses()
                .filter(|address| !checked.contains(address))
                .cloned()
                .collect();

            if addresses.is_empty() {
                break;
            }

            for address in addresses {
                checked.push(address.clone());

                let entry = self.entries.entry(address.clone()).or_default();

                let min_wait = if entry.last_failed {
                    super::COOLDOWN
                } else if force {
                    MIN_HEARTBEAT_FREQUENCY
                } else {
                    options.heartbeat_frequency()
                };
                if let Some(last_check) = entry.last_check {
                    if last_check.elapsed() < min_wait {
                        continue;
                    }
                }

                Self::check_server(&establisher, entry, &address, updater, options).await;
            }
        }

        // Drop cached connections for servers no longer in the topology.
        let current = watcher.peek_latest();
        self.entries
            .retain(|address, _| current.description.get_server_description(address).is_some());
    }

    async fn check_server(
        establisher: &ConnectionEstablisher,
        entry: &mut ScanEntry,
        address: &ServerAddress,
        updater: &TopologyUpdater,
        options: &ClientOptions,
    ) {
        let start = Instant::now();

        let result = match entry.connection {
            Some(ref mut conn) => {
                let command = hello_command(
                    options.load_balanced,
                    conn.stream_description().ok().map(|sd| sd.hello_ok),
                    None,
                );
                run_hello(conn, command).await
            }
            None => {
                establisher
                    .establish_monitoring_connection(address.clone())
                    .await
                    .map(|(connection, reply)| {
                        entry.connection = Some(connection);
                        reply
                    })
            }
        };

        entry.last_check = Some(Instant::now());

        match result {
            Ok(reply) => {
                entry.last_failed = false;
                let description = ServerDescription::new_from_hello_reply(
                    address.clone(),
                    reply,
                    start.elapsed(),
                );
                updater.update(description).await;
            }
            Err(error) => {
                entry.last_failed = true;
                entry.connection = None;
                updater.handle_monitor_error(address.clone(), error).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        options::{ClientOptions, MonitoringMode},
        selection_criteria::ReadPreference,
    };

    // Port 2 on loopback refuses connections immediately, so these tests exercise the real
    // monitor/scan failure paths without a server.
    fn unreachable_options() -> ClientOptions {
        ClientOptions::builder()
            .hosts(vec![ServerAddress::parse("127.0.0.1:2").unwrap()])
            .connect_timeout(Duration::from_millis(100))
            .server_selection_timeout(Duration::from_millis(200))
            .build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monitored_selection_times_out_with_topology_snapshot() {
        let topology = Topology::new(unreachable_options()).unwrap();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let err = topology
            .select_server(&criteria, "ping", None)
            .await
            .unwrap_err();

        assert!(err.is_server_selection_error(), "{:?}", err);
        let message = err.to_string();
        assert!(
            message.contains("Topology"),
            "error should describe the topology: {}",
            message
        );

        topology.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn try_once_scan_fails_fast_and_names_the_option() {
        let mut options = unreachable_options();
        options.monitoring_mode = Some(MonitoringMode::OnDemand);

        let topology = Topology::new(options).unwrap();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let start = std::time::Instant::now();
        let err = topology
            .select_server(&criteria, "insert", None)
            .await
            .unwrap_err();

        assert!(err.is_server_selection_error(), "{:?}", err);
        assert!(
            err.to_string().contains("serverSelectionTryOnce"),
            "unexpected message: {}",
            err
        );
        // A single scan of one dead server must not consume the full selection timeout budget.
        assert!(start.elapsed() < Duration::from_secs(2));

        topology.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_fails_selection_with_shutdown_error() {
        let topology = Topology::new(unreachable_options()).unwrap();
        topology.shutdown().await;

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let err = topology
            .select_server(&criteria, "ping", None)
            .await
            .unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::Shutdown), "{:?}", err);
    }
}
