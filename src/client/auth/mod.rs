//! Contains the types needed to specify the auth configuration for a
//! [`Client`](crate::Client).

mod sasl;
mod scram;
mod x509;

use std::{fmt::Debug, str::FromStr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    cmap::{Connection, StreamDescription},
    counters,
    error::{Error, ErrorKind, Result},
};

use self::scram::ScramVersion;

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const GSSAPI_STR: &str = "GSSAPI";
const PLAIN_STR: &str = "PLAIN";

/// The authentication mechanisms supported by MongoDB.
///
/// Note: not all of these mechanisms are currently supported by the driver core.
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802) and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha256,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-x.509/) for more information.
    MongoDbX509,

    /// Kerberos authentication mechanism as defined in [RFC 4752](http://tools.ietf.org/html/rfc4752).
    ///
    /// Note: this mechanism is outside the driver core; an outer layer may provide it.
    Gssapi,

    /// The SASL PLAIN mechanism, as defined in [RFC 4616](https://tools.ietf.org/html/rfc4616),
    /// used in MongoDB to perform LDAP authentication.
    ///
    /// Note: this mechanism is outside the driver core; an outer layer may provide it.
    Plain,
}

impl AuthMechanism {
    /// The mechanism to use when none was configured: SCRAM-SHA-256 when the server advertises
    /// it for this user, SCRAM-SHA-1 otherwise.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let scram_sha_256_found = description
            .sasl_supported_mechs
            .as_ref()
            .map(|ms| ms.iter().any(|m| m == SCRAM_SHA_256_STR))
            .unwrap_or(false);

        if scram_sha_256_found {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Determines if the provided credentials have the required information to perform
    /// authentication.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                if credential.username.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "No username provided for SCRAM authentication".to_string(),
                    }
                    .into());
                };
                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "A password cannot be specified with MONGODB-X509".to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidArgument {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-X509"
                            .to_string(),
                    }
                    .into());
                }

                Ok(())
            }
            AuthMechanism::Gssapi | AuthMechanism::Plain => Ok(()),
        }
    }

    /// Returns this `AuthMechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            AuthMechanism::Gssapi => GSSAPI_STR,
            AuthMechanism::Plain => PLAIN_STR,
        }
    }

    /// The database commands for this mechanism should be sent to.
    pub(crate) fn default_source<'a>(&self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => uri_db.unwrap_or("admin"),
            AuthMechanism::MongoDbX509 | AuthMechanism::Gssapi | AuthMechanism::Plain => {
                "$external"
            }
        }
    }

    /// Constructs the first message of the speculative authentication handshake, if this
    /// mechanism supports speculative authentication.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            Self::ScramSha1 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha1,
                ScramVersion::Sha1.build_speculative_client_first(credential)?,
            ))),
            Self::ScramSha256 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha256,
                ScramVersion::Sha256.build_speculative_client_first(credential)?,
            ))),
            Self::MongoDbX509 => Ok(Some(ClientFirst::X509(Box::new(
                x509::build_speculative_client_first(credential),
            )))),
            Self::Gssapi | Self::Plain => Ok(None),
        }
    }

    /// Performs the authentication conversation for this mechanism on a freshly handshaked
    /// connection.
    pub(crate) async fn authenticate_stream(
        &self,
        stream: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                ScramVersion::Sha1
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::ScramSha256 => {
                ScramVersion::Sha256
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::MongoDbX509 => x509::authenticate_stream(stream, credential, None).await,
            _ => Err(ErrorKind::Authentication {
                message: format!(
                    "Authentication mechanism {:?} not supported by the driver core",
                    self
                ),
            }
            .into()),
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            GSSAPI_STR => Ok(AuthMechanism::Gssapi),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned a
/// default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted when
    /// authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to "admin"
    /// in SCRAM authentication mechanisms and "$external" for GSSAPI, MONGODB-X509, and PLAIN.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    /// The database this credential's commands should be sent to.
    pub(crate) fn resolved_source(&self) -> &str {
        self.mechanism
            .as_ref()
            .map(|m| m.default_source(self.source.as_deref()))
            .unwrap_or_else(|| self.source.as_deref().unwrap_or("admin"))
    }

    /// If the mechanism needs to be negotiated, add `saslSupportedMechs` to the handshake.
    pub(crate) fn append_needed_mechanism_negotiation(&self, body: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            body.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Validates the credential for consistency, delegating to the mechanism's validation when
    /// one is set.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref mechanism) = self.mechanism {
            mechanism.validate_credential(self)?;
        } else if self.username.is_none() {
            return Err(ErrorKind::InvalidArgument {
                message: "cannot authenticate without a username or an explicit mechanism"
                    .to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Attaches the speculative authentication payload for this credential to the handshake
    /// body, returning the in-progress conversation state.
    pub(crate) fn append_speculative_authenticate(
        &self,
        body: &mut Document,
    ) -> Result<Option<ClientFirst>> {
        let mechanism = match self.mechanism.as_ref() {
            Some(mechanism) => mechanism.clone(),
            // With no explicit mechanism, speculate with SCRAM-SHA-256; a server that doesn't
            // support it simply omits the speculative reply and authentication proceeds normally.
            None if self.username.is_some() => AuthMechanism::ScramSha256,
            None => return Ok(None),
        };

        let client_first = mechanism.build_speculative_client_first(self)?;
        if let Some(ref client_first) = client_first {
            body.insert("speculativeAuthenticate", client_first.to_document());
        }

        Ok(client_first)
    }

    /// Completes authentication on a connection whose handshake carried (or failed to carry) a
    /// speculative authentication exchange.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        speculative: Option<SpeculativeOutcome>,
    ) -> Result<()> {
        let result = self.authenticate_stream_inner(conn, speculative).await;
        match result {
            Ok(()) => counters::incr(&counters::AUTH_SUCCESS),
            Err(_) => counters::incr(&counters::AUTH_FAILURE),
        }
        result
    }

    async fn authenticate_stream_inner(
        &self,
        conn: &mut Connection,
        speculative: Option<SpeculativeOutcome>,
    ) -> Result<()> {
        // A successful speculative round folds the saslStart exchange into the handshake.
        if let Some(outcome) = speculative {
            match outcome.client_first {
                ClientFirst::Scram(version, client_first) => {
                    return version
                        .authenticate_stream(
                            conn,
                            self,
                            Some(scram::FirstRound {
                                client_first,
                                server_first: outcome.server_first,
                            }),
                        )
                        .await;
                }
                ClientFirst::X509(..) => {
                    return x509::authenticate_stream(conn, self, Some(outcome.server_first)).await;
                }
            }
        }

        let mechanism = match self.mechanism.as_ref() {
            Some(mechanism) => mechanism.clone(),
            None => AuthMechanism::from_stream_description(conn.stream_description()?),
        };

        mechanism.authenticate_stream(conn, self).await
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("source", &self.source)
            .field("password", &self.password.as_ref().map(|_| "REDACTED"))
            .field("mechanism", &self.mechanism)
            .field("mechanism_properties", &"...")
            .finish()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.source == other.source
            && self.password == other.password
            && self.mechanism == other.mechanism
            && self.mechanism_properties == other.mechanism_properties
    }
}

/// The first message of an authentication conversation, folded into the handshake when
/// speculating.
#[derive(Clone, Debug)]
pub(crate) enum ClientFirst {
    Scram(ScramVersion, scram::ClientFirst),
    X509(Box<Document>),
}

impl ClientFirst {
    pub(crate) fn to_document(&self) -> Document {
        match self {
            Self::Scram(version, client_first) => client_first.to_command(version).body,
            Self::X509(command) => (**command).clone(),
        }
    }
}

/// The server's answer to a speculative authentication attempt, paired with the client state
/// that produced it.
#[derive(Debug)]
pub(crate) struct SpeculativeOutcome {
    pub(crate) client_first: ClientFirst,
    pub(crate) server_first: Document,
}

pub(crate) fn generate_nonce() -> String {
    let mut result = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut result);
    BASE64.encode(result)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mechanism_negotiation_is_requested_when_unspecified() {
        let credential = Credential::builder()
            .username("alice")
            .password("hunter2")
            .build();

        let mut body = crate::bson::doc! { "hello": 1 };
        credential.append_needed_mechanism_negotiation(&mut body);
        assert_eq!(
            body.get_str("saslSupportedMechs").unwrap(),
            "admin.alice"
        );
    }

    #[test]
    fn x509_resolves_to_external_source() {
        let credential = Credential::builder()
            .mechanism(AuthMechanism::MongoDbX509)
            .build();
        assert_eq!(credential.resolved_source(), "$external");
        assert!(credential.validate().is_ok());
    }

    #[test]
    fn x509_rejects_password() {
        let credential = Credential::builder()
            .mechanism(AuthMechanism::MongoDbX509)
            .password("nope")
            .build();
        assert!(credential.validate().is_err());
    }

    #[test]
    fn scram_requires_username() {
        let credential = Credential::builder()
            .mechanism(AuthMechanism::ScramSha256)
            .build();
        assert!(credential.validate().is_err());
    }

    #[test]
    fn mechanism_strings_round_trip() {
        for mechanism in [
            AuthMechanism::ScramSha1,
            AuthMechanism::ScramSha256,
            AuthMechanism::MongoDbX509,
            AuthMechanism::Gssapi,
            AuthMechanism::Plain,
        ] {
            assert_eq!(
                mechanism.as_str().parse::<AuthMechanism>().unwrap(),
                mechanism
            );
        }
    }
}
