//! TLS support for outbound links.
//!
//! Trust comes from either the system roots or a configured SHA-1
//! certificate fingerprint pin; with a pin configured, ordinary chain
//! verification is replaced by the post-handshake fingerprint check.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

use crate::config::NetConfig;
use crate::error::ProtocolError;

/// Certificate verifier that accepts any chain. Only used when the trust
/// decision is delegated to the fingerprint pin.
#[derive(Debug)]
pub struct PinnedOnlyVerifier;

impl ServerCertVerifier for PinnedOnlyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Hex SHA-1 of a DER certificate, for fingerprint pinning.
pub fn sha1_fingerprint(der: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, der);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn load_client_cert(
    certfile: &str,
    keyfile: &str,
) -> Result<
    (
        Vec<CertificateDer<'static>>,
        tokio_rustls::rustls::pki_types::PrivateKeyDer<'static>,
    ),
    ProtocolError,
> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(certfile)?))
            .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        keyfile,
    )?))?
    .ok_or_else(|| ProtocolError::Tls(format!("no private key found in {keyfile}")))?;
    Ok((certs, key))
}

/// Upgrade a TCP stream to TLS per the network's configuration, enforcing
/// the fingerprint pin when one is set.
pub async fn upgrade(
    netname: &str,
    conf: &NetConfig,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, ProtocolError> {
    let builder = if conf.ssl_fingerprint.is_some() {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedOnlyVerifier))
    } else {
        let mut roots = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            if let Err(e) = roots.add(cert) {
                warn!(net = %netname, error = %e, "failed to add root cert");
            }
        }
        for e in &certs.errors {
            warn!(net = %netname, error = %e, "error loading native certs");
        }
        ClientConfig::builder().with_root_certificates(roots)
    };

    let config = match (&conf.ssl_certfile, &conf.ssl_keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let (certs, key) = load_client_cert(certfile, keyfile)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ProtocolError::Tls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(conf.ip.clone())
        .map_err(|e| ProtocolError::Tls(e.to_string()))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProtocolError::Tls(e.to_string()))?;

    if let Some(expected) = &conf.ssl_fingerprint {
        let expected_norm: String = expected
            .chars()
            .filter(|c| *c != ':')
            .collect::<String>()
            .to_lowercase();
        let peer = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| ProtocolError::Tls("peer sent no certificate".to_string()))?;
        let actual = sha1_fingerprint(peer.as_ref());
        if actual != expected_norm {
            return Err(ProtocolError::FingerprintMismatch {
                expected: expected_norm,
                actual,
            });
        }
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_fingerprint_format() {
        let fp = sha1_fingerprint(b"not really a certificate");
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
