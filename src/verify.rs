//! Server certificate pinning.
//!
//! A server is trusted when the certificate it presents is valid for the
//! configured host name *and* has the same subject and SHA-256 digest as a
//! locally stored reference certificate. No certificate authority is consulted.
//!
//! # Example
//!
//! ```no_run
//! use idle_sync::verify::{CertificateVerifier, PinnedCertificate};
//!
//! # fn example(peer_der: &[u8]) -> idle_sync::Result<()> {
//! let pinned = PinnedCertificate::load("/home/me/.certs/imap.example.org.pem")?;
//! let verifier = CertificateVerifier::new("imap.example.org", pinned);
//!
//! match verifier.verify(peer_der) {
//!     Ok(()) => println!("trusted"),
//!     Err(reason) => println!("rejected: {reason}"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ServerName};
use sha2::{Digest, Sha256};
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

/// Why a presented certificate was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// The certificate is not valid for the configured host name.
    #[error("hosts do not match")]
    HostMismatch,
    /// The certificate subject differs from the pinned certificate.
    #[error("subjects don't match")]
    SubjectMismatch,
    /// The certificate digest differs from the pinned certificate.
    #[error("digests don't match")]
    DigestMismatch,
    /// The certificate could not be decoded.
    #[error("malformed certificate: {0}")]
    Malformed(String),
}

/// A locally trusted reference certificate.
#[derive(Clone)]
pub struct PinnedCertificate {
    subject: Vec<u8>,
    subject_display: String,
    digest: [u8; 32],
}

impl PinnedCertificate {
    /// Reads a pinned certificate from a PEM or DER file.
    ///
    /// For PEM files holding several certificates the first one is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadCertificate`] if the file cannot be read and
    /// [`Error::InvalidCertificate`] if it does not contain a certificate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| Error::LoadCertificate {
            path: path.to_path_buf(),
            source,
        })?;

        let der = if bytes.starts_with(b"-----BEGIN") {
            let mut reader = BufReader::new(bytes.as_slice());
            rustls_pemfile::certs(&mut reader)
                .map_err(|source| Error::LoadCertificate {
                    path: path.to_path_buf(),
                    source,
                })?
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidCertificate {
                    path: path.to_path_buf(),
                    reason: VerificationError::Malformed("no certificate in PEM file".into()),
                })?
        } else {
            bytes
        };

        Self::from_der(&der).map_err(|reason| Error::InvalidCertificate {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Builds a pinned certificate from its DER encoding.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::Malformed`] if `der` is not a certificate.
    pub fn from_der(der: &[u8]) -> std::result::Result<Self, VerificationError> {
        let cert = parse(der)?;
        Ok(Self {
            subject: cert.subject().as_raw().to_vec(),
            subject_display: cert.subject().to_string(),
            digest: Sha256::digest(der).into(),
        })
    }

    /// Hex-encoded SHA-256 digest of the certificate.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(self.digest)
    }
}

impl std::fmt::Debug for PinnedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedCertificate")
            .field("subject", &self.subject_display)
            .field("sha256", &self.fingerprint())
            .finish()
    }
}

/// Checks a presented certificate against a host name and a pinned certificate.
#[derive(Debug, Clone)]
pub struct CertificateVerifier {
    host: String,
    pinned: PinnedCertificate,
}

impl CertificateVerifier {
    /// Creates a verifier for the configured server host.
    #[must_use]
    pub fn new(host: impl Into<String>, pinned: PinnedCertificate) -> Self {
        Self {
            host: host.into(),
            pinned,
        }
    }

    /// Returns the host name certificates are checked against.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Verifies the DER-encoded peer certificate.
    ///
    /// The host name is checked first, then the subject, then the digest.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`VerificationError`].
    pub fn verify(&self, peer_der: &[u8]) -> std::result::Result<(), VerificationError> {
        let peer = parse(peer_der)?;

        if !matches_host(&peer, &self.host) {
            return Err(VerificationError::HostMismatch);
        }
        if peer.subject().as_raw() != self.pinned.subject.as_slice() {
            return Err(VerificationError::SubjectMismatch);
        }
        let digest: [u8; 32] = Sha256::digest(peer_der).into();
        if digest != self.pinned.digest {
            return Err(VerificationError::DigestMismatch);
        }

        debug!(host = %self.host, sha256 = %self.pinned.fingerprint(), "Certificate matches pin");
        Ok(())
    }
}

fn parse(der: &[u8]) -> std::result::Result<X509Certificate<'_>, VerificationError> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| VerificationError::Malformed(e.to_string()))
}

/// Standard host name matching against subject alternative names, falling
/// back to the common name when the certificate carries no DNS names.
fn matches_host(cert: &X509Certificate<'_>, host: &str) -> bool {
    let host = host.trim_end_matches('.');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip_names(cert).any(|candidate| candidate == ip);
    }

    let dns_names: Vec<&str> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(*dns),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if dns_names.is_empty() {
        return cert
            .subject()
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .any(|cn| dns_name_matches(cn, host));
    }

    dns_names.iter().any(|pattern| dns_name_matches(pattern, host))
}

fn ip_names<'a>(cert: &'a X509Certificate<'_>) -> impl Iterator<Item = IpAddr> + 'a {
    let names = match cert.subject_alternative_name() {
        Ok(Some(san)) => san.value.general_names.as_slice(),
        _ => &[],
    };
    names.iter().filter_map(|name| match name {
        GeneralName::IPAddress(bytes) => match bytes.len() {
            4 => <[u8; 4]>::try_from(*bytes).ok().map(IpAddr::from),
            16 => <[u8; 16]>::try_from(*bytes).ok().map(IpAddr::from),
            _ => None,
        },
        _ => None,
    })
}

/// A wildcard is only honoured as the whole left-most label and never
/// matches across dots.
fn dns_name_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');

    match pattern.strip_prefix("*.") {
        Some(suffix) => match host.split_once('.') {
            Some((label, rest)) => {
                !label.is_empty() && suffix.contains('.') && rest.eq_ignore_ascii_case(suffix)
            }
            None => false,
        },
        None => pattern.eq_ignore_ascii_case(host),
    }
}

/// rustls adapter that runs [`CertificateVerifier`] during the handshake.
///
/// The last rejection is kept so the connection layer can report which check
/// failed instead of a generic handshake error.
pub(crate) struct PinnedServerVerifier {
    verifier: CertificateVerifier,
    rejection: Mutex<Option<VerificationError>>,
}

impl PinnedServerVerifier {
    pub(crate) fn new(verifier: CertificateVerifier) -> Self {
        Self {
            verifier,
            rejection: Mutex::new(None),
        }
    }

    /// Takes the rejection recorded during the last handshake, if any.
    pub(crate) fn take_rejection(&self) -> Option<VerificationError> {
        self.rejection
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or_default()
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.verifier.verify(&end_entity.0) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(reason) => {
                warn!(host = %self.verifier.host(), reason = %reason, "Rejecting server certificate");
                let message = reason.to_string();
                if let Ok(mut slot) = self.rejection.lock() {
                    *slot = Some(reason);
                }
                Err(rustls::Error::General(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{Certificate as GeneratedCert, CertificateParams, DnType};

    fn generate(names: &[&str], common_name: Option<&str>) -> Vec<u8> {
        let mut params =
            CertificateParams::new(names.iter().map(|n| (*n).to_string()).collect::<Vec<_>>());
        if let Some(cn) = common_name {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        GeneratedCert::from_params(params)
            .unwrap()
            .serialize_der()
            .unwrap()
    }

    fn verifier_for(host: &str, pinned_der: &[u8]) -> CertificateVerifier {
        CertificateVerifier::new(host, PinnedCertificate::from_der(pinned_der).unwrap())
    }

    #[test]
    fn test_accepts_pinned_certificate() {
        let der = generate(&["imap.example.org"], Some("imap.example.org"));
        let verifier = verifier_for("imap.example.org", &der);
        assert_eq!(verifier.verify(&der), Ok(()));
    }

    #[test]
    fn test_rejects_other_host() {
        let der = generate(&["imap.example.org"], Some("imap.example.org"));
        let verifier = verifier_for("mail.example.net", &der);
        assert_eq!(verifier.verify(&der), Err(VerificationError::HostMismatch));
    }

    #[test]
    fn test_rejects_different_subject() {
        let pinned = generate(&["imap.example.org"], Some("pinned"));
        let peer = generate(&["imap.example.org"], Some("impostor"));
        let verifier = verifier_for("imap.example.org", &pinned);
        assert_eq!(verifier.verify(&peer), Err(VerificationError::SubjectMismatch));
    }

    #[test]
    fn test_rejects_same_subject_different_key() {
        let pinned = generate(&["imap.example.org"], Some("imap.example.org"));
        let peer = generate(&["imap.example.org"], Some("imap.example.org"));
        let verifier = verifier_for("imap.example.org", &pinned);
        assert_eq!(verifier.verify(&peer), Err(VerificationError::DigestMismatch));
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(VerificationError::HostMismatch.to_string(), "hosts do not match");
        assert_eq!(
            VerificationError::SubjectMismatch.to_string(),
            "subjects don't match"
        );
        assert_eq!(VerificationError::DigestMismatch.to_string(), "digests don't match");
    }

    #[test]
    fn test_rejects_garbage() {
        let der = generate(&["imap.example.org"], None);
        let verifier = verifier_for("imap.example.org", &der);
        assert!(matches!(
            verifier.verify(b"not a certificate"),
            Err(VerificationError::Malformed(_))
        ));
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(dns_name_matches("*.example.org", "imap.example.org"));
        assert!(dns_name_matches("IMAP.Example.org", "imap.example.org"));
        assert!(!dns_name_matches("*.example.org", "a.b.example.org"));
        assert!(!dns_name_matches("*.example.org", "example.org"));
        assert!(!dns_name_matches("*.org", "example.org"));
    }

    #[test]
    fn test_wildcard_certificate() {
        let der = generate(&["*.example.org"], None);
        let verifier = verifier_for("imap.example.org", &der);
        assert_eq!(verifier.verify(&der), Ok(()));
    }

    #[test]
    fn test_ip_address_names() {
        let der = generate(&["127.0.0.1"], None);
        assert_eq!(verifier_for("127.0.0.1", &der).verify(&der), Ok(()));
        assert_eq!(
            verifier_for("127.0.0.2", &der).verify(&der),
            Err(VerificationError::HostMismatch)
        );
    }

    #[test]
    fn test_load_der_file() {
        let der = generate(&["imap.example.org"], None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.der");
        std::fs::write(&path, &der).unwrap();

        let pinned = PinnedCertificate::load(&path).unwrap();
        let expected: [u8; 32] = Sha256::digest(&der).into();
        assert_eq!(pinned.fingerprint(), hex::encode(expected));
    }

    #[test]
    fn test_load_missing_file() {
        let result = PinnedCertificate::load("/nonexistent/idle-sync/cert.pem");
        assert!(matches!(result, Err(Error::LoadCertificate { .. })));
    }

    #[test]
    fn test_adapter_records_rejection() {
        let pinned = generate(&["imap.example.org"], Some("imap.example.org"));
        let peer = generate(&["imap.example.org"], Some("imap.example.org"));
        let adapter = PinnedServerVerifier::new(verifier_for("imap.example.org", &pinned));
        let server_name = ServerName::try_from("imap.example.org").unwrap();

        let result = adapter.verify_server_cert(
            &Certificate(peer),
            &[],
            &server_name,
            &mut std::iter::empty(),
            &[],
            SystemTime::now(),
        );

        assert!(result.is_err());
        assert_eq!(adapter.take_rejection(), Some(VerificationError::DigestMismatch));
        assert_eq!(adapter.take_rejection(), None);
    }
}
