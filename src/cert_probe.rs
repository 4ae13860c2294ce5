//! TLS certificate probe
//!
//! Opens a raw TLS connection to the host and reports the leaf certificate.
//! The handshake accepts any certificate so expired or self-signed ones can
//! still be described; whether the chain is trusted by the platform roots is
//! evaluated on the side and reported as `authorized`.

use crate::{AnalyzerError, CertificateSettings};
use async_trait::async_trait;
use openssl::asn1::Asn1Time;
use openssl::x509::{X509NameRef, X509};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Leaf certificate details
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    /// Subject attributes keyed by short name (`CN`, `O`, ...)
    pub subject: BTreeMap<String, String>,
    pub issuer: BTreeMap<String, String>,
    pub valid_from: String,
    pub valid_to: String,
    pub is_expired: bool,
    pub days_remaining: i64,
    pub serial_number: String,
    /// Chain verified against the platform trust store
    pub authorized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_error: Option<String>,
}

/// Certificate section of the report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CertificateBlock {
    Info(CertificateInfo),
    Failed {
        error: String,
        #[serde(rename = "timedOut")]
        timed_out: bool,
    },
}

impl CertificateBlock {
    pub fn from_result(result: Result<CertificateInfo, AnalyzerError>) -> Self {
        match result {
            Ok(info) => CertificateBlock::Info(info),
            Err(e) => CertificateBlock::Failed {
                timed_out: e.is_timeout(),
                error: e.to_string(),
            },
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateProbe: Send + Sync {
    async fn probe(&self, hostname: &str) -> Result<CertificateInfo, AnalyzerError>;
}

/// Accepts every certificate while recording the verdict of a real
/// WebPKI verifier.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    verdict: Mutex<Option<Result<(), String>>>,
}

impl RecordingVerifier {
    fn new(roots: Arc<RootCertStore>, provider: Arc<CryptoProvider>) -> Self {
        let inner = match WebPkiServerVerifier::builder_with_provider(roots, provider.clone()).build() {
            Ok(verifier) => Some(verifier),
            Err(e) => {
                debug!("Trust evaluation unavailable: {}", e);
                None
            }
        };

        Self {
            inner,
            provider,
            verdict: Mutex::new(None),
        }
    }

    fn verdict(&self) -> Result<(), String> {
        self.verdict
            .lock()
            .ok()
            .and_then(|v| v.clone())
            .unwrap_or_else(|| Err("certificate was not evaluated".to_string()))
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verdict = match &self.inner {
            Some(verifier) => verifier
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            None => Err("no trusted root certificates available".to_string()),
        };

        if let Ok(mut slot) = self.verdict.lock() {
            *slot = Some(verdict);
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub struct TlsCertificateProber {
    settings: CertificateSettings,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl TlsCertificateProber {
    /// Prober trusting the platform's native root certificates.
    pub fn new(settings: CertificateSettings) -> Self {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            warn!("Failed to load a native root certificate: {}", e);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!("Loaded {} native root certificates ({} ignored)", added, ignored);

        Self::with_roots(settings, roots)
    }

    pub fn with_roots(settings: CertificateSettings, roots: RootCertStore) -> Self {
        Self {
            settings,
            roots: Arc::new(roots),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    async fn handshake(&self, hostname: &str) -> Result<CertificateInfo, AnalyzerError> {
        let verifier = Arc::new(RecordingVerifier::new(self.roots.clone(), self.provider.clone()));

        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| AnalyzerError::Certificate(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();

        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| AnalyzerError::Certificate(format!("invalid hostname '{hostname}': {e}")))?;

        let stream = TcpStream::connect((hostname, self.settings.port))
            .await
            .map_err(|e| AnalyzerError::Certificate(format!("connection failed: {e}")))?;

        let tls = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|e| AnalyzerError::Certificate(format!("TLS handshake failed: {e}")))?;

        let (_, connection) = tls.get_ref();
        let leaf = connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| AnalyzerError::Certificate("server presented no certificate".to_string()))?;

        let mut info = parse_certificate(leaf.as_ref())?;
        match verifier.verdict() {
            Ok(()) => info.authorized = true,
            Err(reason) => info.authorization_error = Some(reason),
        }

        Ok(info)
    }
}

#[async_trait]
impl CertificateProbe for TlsCertificateProber {
    async fn probe(&self, hostname: &str) -> Result<CertificateInfo, AnalyzerError> {
        debug!("Probing certificate of {}:{}", hostname, self.settings.port);

        // Dropping the handshake future on timeout closes the socket
        let info = timeout(self.settings.timeout, self.handshake(hostname))
            .await
            .map_err(|_| AnalyzerError::timeout("certificate probe", self.settings.timeout))??;

        info!(
            "Certificate for {}: expires {} ({} days), authorized={}",
            hostname, info.valid_to, info.days_remaining, info.authorized
        );
        Ok(info)
    }
}

fn name_entries(name: &X509NameRef) -> BTreeMap<String, String> {
    name.entries()
        .filter_map(|entry| {
            let key = entry.object().nid().short_name().ok()?.to_string();
            let value = entry.data().as_utf8().ok()?.to_string();
            Some((key, value))
        })
        .collect()
}

/// Describe a DER certificate. Trust fields are left unset.
pub fn parse_certificate(der: &[u8]) -> Result<CertificateInfo, AnalyzerError> {
    let cert_err = |e: openssl::error::ErrorStack| AnalyzerError::Certificate(e.to_string());

    let cert = X509::from_der(der).map_err(cert_err)?;
    let now = Asn1Time::days_from_now(0).map_err(cert_err)?;
    let remaining = now.diff(cert.not_after()).map_err(cert_err)?;
    let is_expired = remaining.days < 0 || (remaining.days == 0 && remaining.secs < 0);

    let serial_number = cert
        .serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
        .map_err(cert_err)?;

    Ok(CertificateInfo {
        subject: name_entries(cert.subject_name()),
        issuer: name_entries(cert.issuer_name()),
        valid_from: cert.not_before().to_string(),
        valid_to: cert.not_after().to_string(),
        is_expired,
        days_remaining: i64::from(remaining.days),
        serial_number,
        authorized: false,
        authorization_error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{date_time_ymd, CertificateParams, DnType, KeyPair};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn self_signed(expired: bool) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "probe.test");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Probe Test Org");
        if expired {
            params.not_before = date_time_ymd(2020, 1, 1);
            params.not_after = date_time_ymd(2021, 1, 1);
        } else {
            params.not_before = date_time_ymd(2024, 1, 1);
            params.not_after = date_time_ymd(2099, 1, 1);
        }
        let cert = params.self_signed(&key).unwrap();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        (cert.der().clone(), key_der)
    }

    async fn spawn_tls_server(expired: bool) -> u16 {
        let (cert, key) = self_signed(expired);
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(stream).await {
                        use tokio::io::AsyncReadExt;
                        let mut buf = [0u8; 16];
                        let _ = tls.read(&mut buf).await;
                    }
                });
            }
        });
        port
    }

    fn prober(port: u16, limit: Duration) -> TlsCertificateProber {
        TlsCertificateProber::with_roots(
            CertificateSettings {
                timeout: limit,
                port,
            },
            RootCertStore::empty(),
        )
    }

    #[tokio::test]
    async fn test_probe_reports_self_signed_certificate() {
        let port = spawn_tls_server(false).await;
        let info = prober(port, Duration::from_secs(5))
            .probe("127.0.0.1")
            .await
            .unwrap();

        assert_eq!(info.subject.get("CN").map(String::as_str), Some("probe.test"));
        assert_eq!(info.issuer.get("O").map(String::as_str), Some("Probe Test Org"));
        assert!(!info.is_expired);
        assert!(info.days_remaining > 365);
        assert!(!info.authorized);
        assert!(info.authorization_error.is_some());
    }

    #[tokio::test]
    async fn test_probe_reports_expired_certificate() {
        let port = spawn_tls_server(true).await;
        let info = prober(port, Duration::from_secs(5))
            .probe("127.0.0.1")
            .await
            .unwrap();

        assert!(info.is_expired);
        assert!(info.days_remaining < 0);
        assert!(info.valid_to.contains("2021"));
    }

    #[tokio::test]
    async fn test_probe_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let err = prober(port, Duration::from_millis(200))
            .probe("127.0.0.1")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_probe_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = prober(port, Duration::from_secs(2))
            .probe("127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Certificate(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_certificate(b"not a certificate"),
            Err(AnalyzerError::Certificate(_))
        ));
    }
}
