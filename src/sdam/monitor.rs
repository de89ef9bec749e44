use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use tokio::sync::Notify;

use super::{
    description::server::ServerDescription, TopologyUpdater, TopologyWatcher, COOLDOWN,
    DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY,
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    event::sdam::{
        SdamEventHandler, ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, run_hello, HelloReply},
    options::{ClientOptions, ServerAddress},
    runtime,
    sdam::public::ServerType,
};

/// The average round trip time of heartbeats to one server, weighted towards history: a single
/// anomalous sample shouldn't evict a server from the latency window.
#[derive(Debug, Default)]
pub(crate) struct RttInfo {
    average: RwLock<Option<Duration>>,
}

impl RttInfo {
    pub(crate) fn average(&self) -> Option<Duration> {
        *self.average.read().expect("lock poisoned")
    }

    /// Folds a new sample into the moving average with the weighting given in the server
    /// selection specification.
    pub(crate) fn add_sample(&self, sample: Duration) {
        let mut guard = self.average.write().expect("lock poisoned");
        *guard = Some(match *guard {
            Some(old) => (sample / 5) + (old * 4 / 5),
            None => sample,
        });
    }

    pub(crate) fn reset(&self) {
        *self.average.write().expect("lock poisoned") = None;
    }
}

/// Monitor that performs regular heartbeats against one server using a dedicated connection,
/// publishing the outcome to the topology.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    check_requester: Arc<Notify>,
    sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,
    client_options: ClientOptions,
    rtt_info: Arc<RttInfo>,
    rtt_monitor_started: bool,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        check_requester: Arc<Notify>,
        establisher: ConnectionEstablisher,
        client_options: ClientOptions,
    ) {
        let sdam_event_handler = client_options.sdam_event_handler.clone();
        let monitor = Self {
            address,
            establisher,
            topology_updater,
            topology_watcher,
            check_requester,
            sdam_event_handler,
            client_options,
            connection: None,
            rtt_info: Arc::new(RttInfo::default()),
            rtt_monitor_started: false,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);

        while self.topology_watcher.is_alive() {
            let check_succeeded = self.check_server().await;

            if !self.topology_watcher.is_alive() {
                break;
            }

            // A dead server that isn't a replica-set member gets the full cooldown; otherwise
            // checks may resume after the minimum interval when selection asks for one.
            let minimum_wait = if !check_succeeded && self.in_cooldown() {
                COOLDOWN
            } else {
                MIN_HEARTBEAT_FREQUENCY
            };

            runtime::delay_for(minimum_wait).await;

            let remaining = heartbeat_frequency.saturating_sub(minimum_wait);
            if !remaining.is_zero() {
                // Wake early if server selection requested an immediate check.
                let _ = runtime::timeout(remaining, self.check_requester.notified()).await;
            }
        }
    }

    /// Whether the cooldown applies to this server: it does unless the server was last known to
    /// be a replica-set member.
    fn in_cooldown(&self) -> bool {
        let server_type = self
            .topology_watcher
            .server_description(&self.address)
            .map(|sd| sd.server_type)
            .unwrap_or(ServerType::Unknown);

        !matches!(
            server_type,
            ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::RsArbiter
                | ServerType::RsOther
        )
    }

    /// Checks the server by running a hello command, retrying once immediately when a network
    /// error interrupts a previously healthy server (the "immediate rescan" rule).
    ///
    /// Returns whether the check succeeded.
    async fn check_server(&mut self) -> bool {
        let check_result = match self.perform_hello().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let previous_description =
                    self.topology_watcher.server_description(&self.address);
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    self.handle_error(e).await;
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                let streaming_capable = self
                    .connection
                    .as_ref()
                    .and_then(|conn| conn.stream_description.as_ref())
                    .map(|sd| sd.supports_streaming_monitoring())
                    .unwrap_or(false);
                if streaming_capable && !self.rtt_monitor_started {
                    // 4.4+ servers hold monitoring hellos open, so RTT has to be sampled by a
                    // sibling task with its own connection.
                    self.start_rtt_monitor();
                }

                let server_description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.rtt_info.average().unwrap_or_default(),
                );
                self.topology_updater.update(server_description).await;
                true
            }
            Err(e) => {
                self.handle_error(e).await;
                false
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        self.emit_event(|handler| {
            handler.handle_server_heartbeat_started_event(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
            });
        });

        let start = Instant::now();
        let result = match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(
                    self.client_options.load_balanced,
                    conn.stream_description().ok().map(|sd| sd.hello_ok),
                    None,
                );
                run_hello(conn, command).await
            }
            None => {
                self.establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await
                    .map(|(connection, reply)| {
                        self.connection = Some(connection);
                        reply
                    })
            }
        };
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.rtt_info.add_sample(duration);

                let mut reply_doc = reply.raw_command_response.clone();
                // Never surface credentials material through monitoring events.
                reply_doc.remove("speculativeAuthenticate");

                self.emit_event(|handler| {
                    handler.handle_server_heartbeat_succeeded_event(
                        ServerHeartbeatSucceededEvent {
                            duration,
                            reply: reply_doc,
                            server_address: self.address.clone(),
                        },
                    );
                });
            }
            Err(ref e) => {
                self.connection.take();
                self.rtt_info.reset();
                self.emit_event(|handler| {
                    handler.handle_server_heartbeat_failed_event(ServerHeartbeatFailedEvent {
                        duration,
                        failure: e.clone(),
                        server_address: self.address.clone(),
                    });
                });
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    fn start_rtt_monitor(&mut self) {
        self.rtt_monitor_started = true;
        let rtt_monitor = RttMonitor {
            address: self.address.clone(),
            connection: None,
            establisher: self.establisher.clone(),
            topology_watcher: self.topology_watcher.clone(),
            rtt_info: self.rtt_info.clone(),
            heartbeat_frequency: self
                .client_options
                .heartbeat_freq
                .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY),
            load_balanced: self.client_options.load_balanced,
        };
        runtime::spawn(rtt_monitor.execute());
    }

    fn emit_event<F>(&self, emit: F)
    where
        F: FnOnce(&Arc<dyn SdamEventHandler>),
    {
        if let Some(ref handler) = self.sdam_event_handler {
            emit(handler);
        }
    }
}

/// Samples round trip times on its own dedicated connection for servers whose monitoring hello
/// is held open by the server.
struct RttMonitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_watcher: TopologyWatcher,
    rtt_info: Arc<RttInfo>,
    heartbeat_frequency: Duration,
    load_balanced: Option<bool>,
}

impl RttMonitor {
    async fn execute(mut self) {
        while self.topology_watcher.is_alive() {
            let _ = self.sample().await;
            runtime::delay_for(self.heartbeat_frequency).await;
        }
    }

    async fn sample(&mut self) -> Result<()> {
        let start = Instant::now();

        match self.connection {
            Some(ref mut conn) => {
                let command = hello_command(
                    self.load_balanced,
                    conn.stream_description().ok().map(|sd| sd.hello_ok),
                    None,
                );
                let result = run_hello(conn, command).await;
                if result.is_err() {
                    self.connection = None;
                }
                result?;
            }
            None => {
                let (connection, _) = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await?;
                self.connection = Some(connection);
            }
        }

        self.rtt_info.add_sample(start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rtt_average_is_exponentially_weighted() {
        let rtt = RttInfo::default();
        rtt.add_sample(Duration::from_millis(100));
        assert_eq!(rtt.average(), Some(Duration::from_millis(100)));

        rtt.add_sample(Duration::from_millis(200));
        // 0.2 * 200ms + 0.8 * 100ms
        assert_eq!(rtt.average(), Some(Duration::from_millis(120)));

        rtt.reset();
        assert_eq!(rtt.average(), None);
    }
}
