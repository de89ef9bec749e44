use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    client::auth::Credential,
    compression::compressors::Compressor,
    concern::{ReadConcern, WriteConcern},
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEventHandler, command::CommandEventHandler, sdam::SdamEventHandler},
    sdam::MIN_HEARTBEAT_FREQUENCY,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
#[serde(untagged)]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str())
            .map_err(|e| <D::Error as serde::de::Error>::custom(format!("{}", e)))
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                // Hostname comparison is case-insensitive per RFC 4343.
                host.eq_ignore_ascii_case(other_host)
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.to_lowercase().hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "invalid server address: \"{}\"; hostname cannot be empty",
                        address
                    ),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;

                if port == 0 {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: \"{}\"; port must be non-zero",
                            address
                        ),
                    }
                    .into());
                }
                if parts.next().is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "address \"{}\" contains more than one unescaped ':'",
                            address
                        ),
                    }
                    .into());
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        match self {
            Self::Tcp { port, .. } => port.unwrap_or(DEFAULT_PORT),
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// Whether the driver monitors servers with background tasks or scans on demand from the
/// selecting task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum MonitoringMode {
    /// One monitor task per server probes on the heartbeat cadence and publishes updates; server
    /// selection blocks on those publications. This is the pooled, multi-threaded mode.
    #[default]
    Background,

    /// No background tasks; the task performing server selection drives topology scans itself,
    /// subject to the minimum heartbeat interval and the failure cooldown. This is the
    /// single-threaded mode of the SDAM specification.
    OnDemand,
}

/// Specifies the TLS configuration that the [`Client`](crate::Client) should use.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Tls {
    /// Enable TLS with the specified options.
    Enabled(TlsOptions),

    /// Disable TLS.
    Disabled,
}

impl From<TlsOptions> for Tls {
    fn from(options: TlsOptions) -> Self {
        Self::Enabled(options)
    }
}

/// Specifies the TLS options that the [`Client`](crate::Client) should use.
///
/// Certificate material arrives pre-parsed (DER); reading and decoding PEM files is the
/// responsibility of the configuration layer above the core.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TlsOptions {
    /// Whether or not the [`Client`](crate::Client) should accept an invalid server certificate.
    ///
    /// The default value is false.
    pub allow_invalid_certificates: Option<bool>,

    /// Additional root certificates (DER bytes) to trust beyond the built-in webpki roots.
    pub ca_certificates: Option<Vec<Vec<u8>>>,
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the Client should connect to.
    ///
    /// Note that by default, the driver will autodiscover other nodes in the cluster. To connect
    /// directly to a single server (rather than autodiscovering the rest of the cluster), set the
    /// `direct_connection` field to `true`.
    #[builder(!default)]
    pub hosts: Vec<ServerAddress>,

    /// The application name that the Client will send to the server as part of the handshake.
    /// This can be used in combination with the server logs to determine which Client is
    /// connected to a server.
    pub app_name: Option<String>,

    /// The compressors that the Client is willing to use in the order they are specified
    /// in the configuration. The Client sends this list of compressors to the server.
    /// The server responds with the intersection of its supported list of compressors.
    pub compressors: Option<Vec<Compressor>>,

    /// The connect timeout passed to each underlying TcpStream when attempting to connect to the
    /// server.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The credential to use for authenticating connections made by this client.
    pub credential: Option<Credential>,

    /// Specifies whether the Client should directly connect to a single host rather than
    /// autodiscover all servers in the cluster.
    ///
    /// The default value is false.
    pub direct_connection: Option<bool>,

    /// The amount of time each monitoring task waits between performing server checks.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// Whether or not the client is connecting to a MongoDB cluster through a load balancer.
    pub load_balanced: Option<bool>,

    /// When running a read operation with a ReadPreference that allows selecting secondaries,
    /// `local_threshold` is used to determine how much longer the average round trip time between
    /// the driver and server is allowed compared to the least round trip time of all the suitable
    /// servers.
    ///
    /// The default value is 15 ms.
    pub local_threshold: Option<Duration>,

    /// The amount of time that a connection can remain idle in a connection pool before being
    /// closed. A value of zero indicates that connections should not be closed due to being idle.
    ///
    /// By default, connections will not be closed due to being idle.
    pub max_idle_time: Option<Duration>,

    /// The maximum amount of connections that the Client should allow to be created in a
    /// connection pool for a given server. If an operation is attempted on a server while
    /// `max_pool_size` connections are checked out, the operation will block until an in-progress
    /// operation finishes and its connection is checked back into the pool.
    ///
    /// The default value is 100.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that should be available in a server's connection pool
    /// at a given time. If fewer than `min_pool_size` connections are in the pool, the background
    /// maintenance task will open connections until the count is back at the floor.
    ///
    /// The default value is 0.
    pub min_pool_size: Option<u32>,

    /// Whether the driver monitors the topology with background tasks or scans it from the
    /// selecting task.
    ///
    /// The default is [`MonitoringMode::Background`].
    pub monitoring_mode: Option<MonitoringMode>,

    /// Specifies the default read concern for operations performed on the Client.
    pub read_concern: Option<ReadConcern>,

    /// The name of the replica set that the Client should connect to. A server reporting a
    /// different set name is removed from the topology.
    pub repl_set_name: Option<String>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria for operations performed on the Client.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The amount of time the Client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// In on-demand monitoring mode, whether server selection gives up after a single topology
    /// scan rather than rescanning until the selection deadline.
    ///
    /// The default value is true. Ignored in background monitoring mode.
    pub server_selection_try_once: Option<bool>,

    /// The amount of time the Client should wait for a socket read or write to return before
    /// timing out. A value of zero means no timeout.
    ///
    /// The default value is no timeout.
    pub socket_timeout: Option<Duration>,

    /// The TLS configuration for the Client to use in its connections with the server.
    ///
    /// By default, TLS is disabled.
    pub tls: Option<Tls>,

    /// Specifies the default write concern for operations performed on the Client.
    pub write_concern: Option<WriteConcern>,

    /// The handler that should process all command-related events.
    #[builder(setter(
        doc = "The handler that should process all command-related events. Note that monitoring \
               command events may incur a performance penalty."
    ))]
    pub command_event_handler: Option<Arc<dyn CommandEventHandler>>,

    /// The handler that should process all connection pool events.
    pub cmap_event_handler: Option<Arc<dyn CmapEventHandler>>,

    /// The handler that should process all server discovery and monitoring events.
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("hosts", &self.hosts)
            .field("app_name", &self.app_name)
            .field("compressors", &self.compressors)
            .field("connect_timeout", &self.connect_timeout)
            .field("credential", &self.credential)
            .field("direct_connection", &self.direct_connection)
            .field("heartbeat_freq", &self.heartbeat_freq)
            .field("load_balanced", &self.load_balanced)
            .field("local_threshold", &self.local_threshold)
            .field("max_idle_time", &self.max_idle_time)
            .field("max_pool_size", &self.max_pool_size)
            .field("min_pool_size", &self.min_pool_size)
            .field("monitoring_mode", &self.monitoring_mode)
            .field("read_concern", &self.read_concern)
            .field("repl_set_name", &self.repl_set_name)
            .field("retry_reads", &self.retry_reads)
            .field("retry_writes", &self.retry_writes)
            .field("selection_criteria", &self.selection_criteria)
            .field("server_selection_timeout", &self.server_selection_timeout)
            .field("server_selection_try_once", &self.server_selection_try_once)
            .field("socket_timeout", &self.socket_timeout)
            .field("tls", &self.tls)
            .field("write_concern", &self.write_concern)
            .finish()
    }
}

impl ClientOptions {
    /// The read preference selection criteria to use for operations that don't specify one,
    /// defaulting to primary reads.
    pub(crate) fn read_preference(&self) -> ReadPreference {
        self.selection_criteria
            .as_ref()
            .and_then(SelectionCriteria::as_read_pref)
            .cloned()
            .unwrap_or(ReadPreference::Primary)
    }

    pub(crate) fn tls_options(&self) -> Option<TlsOptions> {
        match self.tls {
            Some(Tls::Enabled(ref opts)) => Some(opts.clone()),
            _ => None,
        }
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq
            .unwrap_or(crate::sdam::DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn monitoring_mode(&self) -> MonitoringMode {
        self.monitoring_mode.unwrap_or_default()
    }

    /// Ensure the options are mutually consistent before any network activity happens.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "hosts list cannot be empty".to_string(),
            }
            .into());
        }

        if let Some(true) = self.direct_connection {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify multiple seeds with directConnection=true".to_string(),
                }
                .into());
            }
        }

        if let Some(true) = self.load_balanced {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify multiple seeds with loadBalanced=true".to_string(),
                }
                .into());
            }
            if self.repl_set_name.is_some() {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify replicaSet with loadBalanced=true".to_string(),
                }
                .into());
            }
            if self.direct_connection == Some(true) {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify directConnection=true with loadBalanced=true"
                        .to_string(),
                }
                .into());
            }
        }

        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < MIN_HEARTBEAT_FREQUENCY {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "heartbeatFrequencyMS cannot be less than {}ms",
                        MIN_HEARTBEAT_FREQUENCY.as_millis()
                    ),
                }
                .into());
            }
        }

        if let (Some(max), Some(min)) = (self.max_pool_size, self.min_pool_size) {
            if max != 0 && max < min {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "minPoolSize ({}) is invalid: must be lower than maxPoolSize ({})",
                        min, max
                    ),
                }
                .into());
            }
        }

        if let Some(ref compressors) = self.compressors {
            for compressor in compressors {
                compressor.validate()?;
            }
        }

        if let Some(ref credential) = self.credential {
            credential.validate()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parse_normalizes_and_defaults_port() {
        let address = ServerAddress::parse("LocalHost").unwrap();
        assert_eq!(
            address,
            ServerAddress::Tcp {
                host: "localhost".to_string(),
                port: None
            }
        );
        assert_eq!(address.port(), DEFAULT_PORT);
        assert_eq!(address.to_string(), "localhost:27017");
    }

    #[test]
    fn address_equality_ignores_host_case() {
        let a = ServerAddress::Tcp {
            host: "Db0.Example.COM".to_string(),
            port: Some(27017),
        };
        let b = ServerAddress::parse("db0.example.com:27017").unwrap();
        assert_eq!(a, b);

        let mut hasher_a = std::collections::hash_map::DefaultHasher::new();
        let mut hasher_b = std::collections::hash_map::DefaultHasher::new();
        a.hash(&mut hasher_a);
        b.hash(&mut hasher_b);
        assert_eq!(hasher_a.finish(), hasher_b.finish());
    }

    #[test]
    fn address_parse_rejects_invalid() {
        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("host:0").is_err());
        assert!(ServerAddress::parse("host:70000").is_err());
        assert!(ServerAddress::parse("host:123:456").is_err());
    }

    #[test]
    fn validation_catches_inconsistent_options() {
        let two_hosts = vec![
            ServerAddress::parse("a:27017").unwrap(),
            ServerAddress::parse("b:27017").unwrap(),
        ];

        let options = ClientOptions::builder()
            .hosts(two_hosts.clone())
            .direct_connection(true)
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::default()])
            .heartbeat_freq(Duration::from_millis(10))
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::default()])
            .max_pool_size(5_u32)
            .min_pool_size(10_u32)
            .build();
        assert!(options.validate().is_err());

        let options = ClientOptions::builder().hosts(two_hosts).build();
        assert!(options.validate().is_ok());
    }
}
