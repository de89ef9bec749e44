use crate::{
    bson::{doc, Document},
    client::auth::Credential,
    cmap::{Command, Connection},
    error::{Error, Result},
};

/// The body of the `authenticate` command for MONGODB-X509, also usable as a speculative
/// authentication payload.
pub(super) fn build_speculative_client_first(credential: &Credential) -> Document {
    let mut body = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    // The username is optional; 3.4+ servers derive it from the certificate subject.
    if let Some(ref username) = credential.username {
        body.insert("user", username.clone());
    }

    body
}

/// Performs X.509 authentication for a given stream. The server validated the client certificate
/// during the TLS handshake; this command just binds the connection to the certificate subject.
pub(super) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: Option<Document>,
) -> Result<()> {
    // A speculative reply means the server already accepted the authenticate command as part of
    // the handshake.
    if server_first.is_some() {
        return Ok(());
    }

    let body = build_speculative_client_first(credential);
    let command = Command::new("authenticate", "$external", body);

    let response = conn.send_command(command, None).await?;
    response
        .ok_or_command_error()
        .map_err(|e| match *e.kind {
            crate::error::ErrorKind::Command(ref command_error) => {
                Error::authentication_error("MONGODB-X509", &command_error.message)
            }
            _ => e.clone(),
        })?;

    Ok(())
}
