pub(crate) mod handshake;

use std::time::Duration;

use crate::{
    client::auth::Credential,
    cmap::Connection,
    error::Result,
    hello::HelloReply,
    options::{ClientOptions, ServerAddress},
    runtime::TlsConfig,
};

use self::handshake::{Handshaker, HandshakerOptions};

/// Contains the logic to establish a connection: dial the server, handshake, and authenticate.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,
    credential: Option<Credential>,
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    tls_config: Option<TlsConfig>,
}

impl ConnectionEstablisher {
    /// Creates a new establisher for application connections, which authenticate when a
    /// credential is configured.
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        Self::with_credential(options, options.credential.clone(), options.compressors.clone())
    }

    /// Creates a new establisher for monitoring connections. Monitoring traffic never
    /// authenticates and never compresses, since `hello` precedes both.
    pub(crate) fn for_monitoring(options: &ClientOptions) -> Result<Self> {
        Self::with_credential(options, None, None)
    }

    fn with_credential(
        options: &ClientOptions,
        credential: Option<Credential>,
        compressors: Option<Vec<crate::compression::compressors::Compressor>>,
    ) -> Result<Self> {
        let handshaker = Handshaker::new(HandshakerOptions {
            app_name: options.app_name.clone(),
            compressors,
            credential: credential.clone(),
            load_balanced: options.load_balanced.unwrap_or(false),
        });

        let tls_config = match options.tls_options() {
            Some(ref tls_options) => Some(TlsConfig::new(tls_options)?),
            None => None,
        };

        Ok(Self {
            handshaker,
            credential,
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            tls_config,
        })
    }

    /// Establishes a pooled application connection: connect, handshake, authenticate.
    pub(crate) async fn establish_connection(
        &self,
        address: ServerAddress,
        id: u32,
        generation: u32,
    ) -> Result<Connection> {
        let mut connection = Connection::connect(
            id,
            address,
            generation,
            self.connect_timeout,
            self.socket_timeout,
            self.tls_config.as_ref(),
        )
        .await?;

        let handshake_result = self.handshaker.handshake(&mut connection).await?;

        if let Some(ref credential) = self.credential {
            credential
                .authenticate_stream(&mut connection, handshake_result.speculative)
                .await?;
        }

        Ok(connection)
    }

    /// Establishes a dedicated monitoring connection and returns the handshake reply for SDAM.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let mut connection =
            Connection::connect_monitoring(address, self.connect_timeout, self.tls_config.as_ref())
                .await?;

        let handshake_result = self.handshaker.handshake(&mut connection).await?;

        Ok((connection, handshake_result.hello_reply))
    }
}
