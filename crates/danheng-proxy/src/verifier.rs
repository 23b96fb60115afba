//! Upstream TLS: the certificate-trust gate as a rustls verifier.
//!
//! Every upstream handshake runs standard WebPKI validation first. The
//! outcome goes through [`DecisionEngine::certificate_trust`]; an untrusted
//! certificate aborts the handshake with the original validation error.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use danheng_core::{CertificateTrust, CertificateValidation, DecisionEngine};
use hudsucker::hyper_util::client::legacy::connect::Connect;
use hyper_rustls::HttpsConnectorBuilder;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::{ProxyError, Result};

/// Server certificate verifier applying the certificate-trust gate.
#[derive(Debug)]
pub struct GatedCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    engine: DecisionEngine,
}

impl GatedCertVerifier {
    /// Creates a verifier validating against `roots`.
    pub fn new(
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
        engine: DecisionEngine,
    ) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        Ok(Self { inner, engine })
    }
}

impl ServerCertVerifier for GatedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let result = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let validation = match &result {
            Ok(_) => CertificateValidation::Valid,
            Err(e) => CertificateValidation::Invalid(e.to_string()),
        };

        match (self.engine.certificate_trust(&validation), result) {
            (CertificateTrust::Trusted, Ok(verified)) => Ok(verified),
            (CertificateTrust::Trusted, Err(e)) => {
                tracing::debug!(
                    "Accepting unvalidated certificate for {}: {}",
                    server_name.to_str(),
                    e
                );
                Ok(ServerCertVerified::assertion())
            }
            (CertificateTrust::Untrusted, Err(e)) => {
                tracing::warn!(
                    "Rejected upstream certificate for {}: {}",
                    server_name.to_str(),
                    e
                );
                Err(e)
            }
            (CertificateTrust::Untrusted, Ok(_)) => Err(rustls::Error::General(
                "certificate rejected by trust gate".into(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Builds the trust anchors: bundled web roots plus an optional PEM file.
pub fn root_store(extra_ca: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = extra_ca {
        let mut reader = BufReader::new(File::open(path)?);
        let certs = rustls_pemfile::certs(&mut reader).collect::<std::result::Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(ProxyError::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }

        let (added, ignored) = roots.add_parsable_certificates(certs);
        tracing::info!(
            "Trusting {} extra upstream CA certificate(s) from {:?} ({} ignored)",
            added,
            path,
            ignored
        );
    }

    Ok(roots)
}

/// Builds the rustls client config used for upstream connections.
pub fn client_config(roots: RootCertStore, engine: DecisionEngine) -> Result<ClientConfig> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let verifier = GatedCertVerifier::new(roots, provider.clone(), engine)?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(config)
}

/// Builds the HTTP/HTTPS connector the proxy uses to reach upstreams.
pub fn https_connector(
    roots: RootCertStore,
    engine: DecisionEngine,
) -> Result<impl Connect + Clone + Send + Sync + 'static> {
    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(client_config(roots, engine)?)
        .https_or_http()
        .enable_http1()
        .build();

    Ok(connector)
}
