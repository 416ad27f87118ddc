//! TLS for the ingestion listener, including the mutual TLS policy that identifies the client.
use crate::config::TlsVersion;
use crate::session::PeerIdentity;
use crate::{error, Config, Result};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use snafu::prelude::*;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

/// Ready-to-use TLS server settings
#[derive(Clone)]
pub(crate) struct TlsSettings {
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings").finish_non_exhaustive()
    }
}

impl TlsSettings {
    /// Build the TLS settings from the PEM material in the config, or `None` if TLS isn't
    /// configured.
    ///
    /// When a client CA is configured every client must present a certificate that chains to it.
    pub(crate) fn from_config(config: &Config) -> Result<Option<Self>> {
        let (Some(key), Some(cert)) = (&config.tls_key, &config.tls_cert) else {
            return Ok(None);
        };

        let cert_chain = parse_certs(cert, "certificate")?;
        let key = parse_private_key(key)?;

        let versions: &[&'static SupportedProtocolVersion] = match config.tls_min_version {
            TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls13 => &[&rustls::version::TLS13],
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .context(error::TlsConfigSnafu)?;

        let builder = match &config.client_ca {
            Some(client_ca) => {
                let mut roots = RootCertStore::empty();
                for ca in parse_certs(client_ca, "client CA")? {
                    roots.add(ca).context(error::TlsConfigSnafu)?;
                }

                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .context(error::ClientVerifierSnafu)?;

                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut server_config = builder
            .with_single_cert(cert_chain, key)
            .context(error::TlsConfigSnafu)?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Some(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        }))
    }

    /// Perform the TLS handshake on a freshly accepted connection, and work out who the client is.
    pub(crate) async fn accept(
        &self,
        stream: TcpStream,
    ) -> std::io::Result<(TlsStream<TcpStream>, PeerIdentity)> {
        let stream = self.acceptor.accept(stream).await?;

        let common_names = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(common_names)
            .unwrap_or_default();

        debug!(?common_names, "TLS handshake complete");

        Ok((stream, PeerIdentity::Tls { common_names }))
    }
}

/// The subject common names of every certificate in `certs`.  Certificates that can't be parsed
/// contribute nothing.
pub(crate) fn common_names(certs: &[CertificateDer<'_>]) -> Vec<String> {
    let mut names = Vec::new();

    for der in certs {
        match x509_parser::parse_x509_certificate(der.as_ref()) {
            Ok((_, cert)) => {
                names.extend(
                    cert.subject()
                        .iter_common_name()
                        .filter_map(|cn| cn.as_str().ok())
                        .map(ToString::to_string),
                );
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unparsable peer certificate");
            }
        }
    }

    names
}

fn parse_certs(pem: &str, what: &'static str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .context(error::InvalidPemSnafu { what })?;

    ensure!(!certs.is_empty(), error::EmptyPemSnafu { what });

    Ok(certs)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();

    rustls_pemfile::private_key(&mut reader)
        .context(error::InvalidPemSnafu { what: "private key" })?
        .context(error::EmptyPemSnafu { what: "private key" })
}
