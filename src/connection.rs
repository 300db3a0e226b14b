//! Internal module for establishing pinned TLS connections to IMAP servers.
//!
//! Supports implicit TLS and an in-band STARTTLS upgrade. Either way the
//! server certificate is checked against the account's pinned certificate
//! instead of a root store.

use crate::config::{AccountConfig, SecurityMode};
use crate::error::{Error, Result};
use crate::verify::{CertificateVerifier, PinnedCertificate, PinnedServerVerifier};
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

/// A TLS stream over TCP, used for IMAP communication.
pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Establishes a TLS connection to the account's server.
///
/// The pinned certificate is loaded on every call so a replaced file is
/// picked up on reconnect.
#[instrument(
    name = "connection::establish_tls",
    skip_all,
    fields(
        account = %account.id(),
        target_addr = %account.server_address(),
        security = %account.security()
    )
)]
pub(crate) async fn establish_tls_connection(account: &AccountConfig) -> Result<TlsStream> {
    let target_addr = account.server_address();
    let pinned = PinnedCertificate::load(account.certificate_file())?;
    debug!(fingerprint = %pinned.fingerprint(), "Loaded pinned certificate");

    let verifier = Arc::new(PinnedServerVerifier::new(CertificateVerifier::new(
        account.host(),
        pinned,
    )));
    let connector = create_tls_connector(Arc::clone(&verifier));
    let server_name = parse_server_name(account.host())?;

    let tcp_stream = connect_direct(&target_addr).await?;
    let tcp_stream = match account.security() {
        SecurityMode::ImplicitTls => tcp_stream,
        SecurityMode::StartTls => upgrade_plaintext(tcp_stream, &target_addr).await?,
    };

    debug!("Performing TLS handshake");

    connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|source| match verifier.take_rejection() {
            Some(reason) => Error::CertificateRejected {
                host: account.host().to_string(),
                reason,
            },
            None => Error::TlsConnect {
                target: target_addr.clone(),
                source,
            },
        })
}

/// Creates a TLS connector that trusts only the pinned certificate.
fn create_tls_connector(verifier: Arc<PinnedServerVerifier>) -> TlsConnector {
    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(tls_config))
}

/// Parses server name for TLS SNI.
fn parse_server_name(host: &str) -> Result<rustls::ServerName> {
    rustls::ServerName::try_from(host).map_err(|source| Error::InvalidDnsName {
        host: host.to_string(),
        source,
    })
}

/// Issues `STARTTLS` on a plaintext connection and hands back the raw socket.
#[instrument(name = "connection::starttls", skip_all)]
async fn upgrade_plaintext(tcp_stream: TcpStream, target_addr: &str) -> Result<TcpStream> {
    debug!("Requesting STARTTLS upgrade");

    let mut client = async_imap::Client::new(tcp_stream);
    client
        .run_command_and_check_ok("STARTTLS", None)
        .await
        .map_err(|source| Error::StartTls {
            target: target_addr.to_string(),
            source,
        })?;

    Ok(client.into_inner())
}

/// Direct TCP connection.
#[instrument(name = "connection::direct", skip_all)]
async fn connect_direct(target_addr: &str) -> Result<TcpStream> {
    debug!(target = %target_addr, "Establishing direct TCP connection");

    TcpStream::connect(target_addr)
        .await
        .map_err(|source| Error::TcpConnect {
            target: target_addr.to_string(),
            source,
        })
}
