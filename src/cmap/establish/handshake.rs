use std::sync::LazyLock;

use crate::{
    bson::{doc, Bson, Document},
    client::auth::{ClientFirst, Credential, SpeculativeOutcome},
    cmap::{conn::stream_description::StreamDescription, Connection},
    compression::compressors::Compressor,
    error::{ErrorKind, Result},
    hello::{hello_command, run_hello, HelloReply},
};

#[derive(Clone, Debug)]
struct ClientMetadata {
    application: Option<AppMetadata>,
    driver: DriverMetadata,
    os: OsMetadata,
}

#[derive(Clone, Debug)]
struct AppMetadata {
    name: String,
}

#[derive(Clone, Debug)]
struct DriverMetadata {
    name: String,
    version: String,
}

#[derive(Clone, Debug)]
struct OsMetadata {
    os_type: String,
    architecture: String,
}

impl From<ClientMetadata> for Bson {
    fn from(metadata: ClientMetadata) -> Self {
        let mut metadata_doc = Document::new();

        if let Some(application) = metadata.application {
            metadata_doc.insert("application", doc! { "name": application.name });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": metadata.driver.name,
                "version": metadata.driver.version,
            },
        );

        metadata_doc.insert(
            "os",
            doc! {
                "type": metadata.os.os_type,
                "architecture": metadata.os.architecture,
            },
        );

        Bson::Document(metadata_doc)
    }
}

/// The handshake metadata that can be determined statically.
static BASE_CLIENT_METADATA: LazyLock<ClientMetadata> = LazyLock::new(|| ClientMetadata {
    application: None,
    driver: DriverMetadata {
        name: env!("CARGO_PKG_NAME").into(),
        version: env!("CARGO_PKG_VERSION").into(),
    },
    os: OsMetadata {
        os_type: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
    },
});

/// The outcome of a successful handshake.
#[derive(Debug)]
pub(crate) struct HandshakeResult {
    /// The hello reply from the server, also fed to SDAM by monitors.
    pub(crate) hello_reply: HelloReply,

    /// The in-flight speculative authentication conversation, when one was folded into the
    /// handshake and the server answered it.
    pub(crate) speculative: Option<SpeculativeOutcome>,
}

/// The options used to construct a `Handshaker`.
#[derive(Clone, Debug, Default)]
pub(crate) struct HandshakerOptions {
    pub(crate) app_name: Option<String>,
    pub(crate) compressors: Option<Vec<Compressor>>,
    pub(crate) credential: Option<Credential>,
    pub(crate) load_balanced: bool,
}

/// Contains the logic to handshake a connection: run `hello`, capture the server's view on the
/// connection, and negotiate compression.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    options: HandshakerOptions,
    metadata: ClientMetadata,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();

        if let Some(ref app_name) = options.app_name {
            metadata.application = Some(AppMetadata {
                name: app_name.to_string(),
            });
        }

        Self { options, metadata }
    }

    /// Handshakes a connection, setting its stream description, service id, and negotiated
    /// compressor. Returns the hello reply and any speculative authentication state.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HandshakeResult> {
        let load_balanced = if self.options.load_balanced {
            Some(true)
        } else {
            None
        };
        let mut command = hello_command(load_balanced, None, None);

        command.body.insert("client", self.metadata.clone());

        if let Some(ref compressors) = self.options.compressors {
            command.body.insert(
                "compression",
                compressors
                    .iter()
                    .map(|compressor| Bson::String(compressor.name().to_string()))
                    .collect::<Vec<_>>(),
            );
        }

        let client_first = match self.options.credential {
            Some(ref credential) => {
                credential.append_needed_mechanism_negotiation(&mut command.body);
                command.target_db = credential.resolved_source().to_string();
                credential.append_speculative_authenticate(&mut command.body)?
            }
            None => None,
        };

        let hello_reply = run_hello(conn, command).await?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));
        conn.service_id = hello_reply.command_response.service_id;

        if self.options.load_balanced && conn.service_id.is_none() {
            return Err(ErrorKind::IncompatibleServer {
                message: "load-balanced mode was requested, but the server did not return a \
                          serviceId in its hello response"
                    .to_string(),
            }
            .into());
        }

        conn.compressor = self.negotiate_compression(&hello_reply);

        let speculative = match (client_first, &hello_reply.command_response.speculative_authenticate)
        {
            (Some(client_first), Some(server_first)) => Some(SpeculativeOutcome {
                client_first,
                server_first: server_first.clone(),
            }),
            _ => None,
        };

        Ok(HandshakeResult {
            hello_reply,
            speculative,
        })
    }

    /// Picks the first client-configured compressor the server also supports.
    fn negotiate_compression(&self, reply: &HelloReply) -> Option<Compressor> {
        let client_list = self.options.compressors.as_ref()?;
        let server_list = reply.command_response.compressors.as_ref()?;

        client_list
            .iter()
            .find(|compressor| server_list.iter().any(|name| name == compressor.name()))
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_includes_driver_and_os() {
        let bson: Bson = BASE_CLIENT_METADATA.clone().into();
        let doc = match bson {
            Bson::Document(doc) => doc,
            other => panic!("expected document metadata, got {:?}", other),
        };
        assert_eq!(
            doc.get_document("driver").unwrap().get_str("name").unwrap(),
            "mongodb-core"
        );
        assert!(doc.get_document("os").unwrap().contains_key("type"));
    }
}
