//! TLS setup with BoringSSL.
//!
//! [`TlsConnector`] is built once per transport from [`TlsSettings`]: it
//! loads trust and key material, pins negotiation to a single protocol
//! version, and applies the hostname verification policy on every handshake.

use crate::base::error::ClientError;
use crate::base::neterror::{NetError, NetFailure};
use crate::config::{HostnameVerification, StoreLocation, TlsSettings};
use boring::pkcs12::Pkcs12;
use boring::pkey::PKey;
use boring::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode};
use boring::x509::{X509VerifyError, X509VerifyResult, X509};
use std::fs;
use tokio::net::TcpStream;
use tokio_boring::{HandshakeError, SslStream};

const ALPN_HTTP11: &[u8] = b"\x08http/1.1";
const PEM_MARKER: &[u8] = b"-----BEGIN";

/// Client-side TLS context for one endpoint.
pub struct TlsConnector {
    connector: SslConnector,
    hostname_verification: HostnameVerification,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("hostname_verification", &self.hostname_verification)
            .finish()
    }
}

impl TlsConnector {
    /// Build the TLS context. All material is read here, so bad files fail
    /// before any connection is attempted.
    pub fn new(settings: &TlsSettings) -> Result<Self, ClientError> {
        let mut builder = SslConnector::builder(SslMethod::tls())
            .map_err(|e| ClientError::configuration_with("cannot create TLS context", e))?;

        let version = settings.protocol.to_ssl_version();
        let pin_error = |e| {
            ClientError::configuration_with(
                format!("cannot pin TLS protocol to {:?}", settings.protocol),
                e,
            )
        };
        builder.set_min_proto_version(Some(version)).map_err(pin_error)?;
        builder.set_max_proto_version(Some(version)).map_err(pin_error)?;
        builder
            .set_alpn_protos(ALPN_HTTP11)
            .map_err(|e| ClientError::configuration_with("cannot set ALPN", e))?;

        if let Some(trust) = &settings.trust_store {
            load_trust_store(&mut builder, trust)?;
        }
        if let Some(key) = &settings.key_store {
            load_key_store(&mut builder, key)?;
        }

        if settings.trust_self_signed {
            // Only the missing-issuer verdict on a self-signed chain is waived.
            // Hostname, expiry and signature checks still apply.
            builder.set_verify_callback(SslVerifyMode::PEER, |preverify_ok, ctx| {
                preverify_ok || is_self_signed(ctx.verify_result())
            });
        } else {
            builder.set_verify(SslVerifyMode::PEER);
        }

        if matches!(settings.hostname_verification, HostnameVerification::AllowAll) {
            tracing::warn!("TLS hostname verification disabled");
        }

        Ok(Self {
            connector: builder.build(),
            hostname_verification: settings.hostname_verification.clone(),
        })
    }

    /// Run the handshake over `stream` for `host`.
    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<SslStream<TcpStream>, NetFailure> {
        let mut config = self
            .connector
            .configure()
            .map_err(|e| NetFailure::new(NetError::SslProtocolError, e))?;
        config.set_use_server_name_indication(should_set_sni(host));
        if !matches!(self.hostname_verification, HostnameVerification::Strict) {
            config.set_verify_hostname(false);
        }

        let tls = tokio_boring::connect(config, host, stream)
            .await
            .map_err(|e| NetFailure::new(classify_handshake(&e), e.to_string()))?;

        if let HostnameVerification::Custom(verify) = &self.hostname_verification {
            let accepted = tls
                .ssl()
                .peer_certificate()
                .map(|cert| verify(host, &*cert))
                .unwrap_or(false);
            if !accepted {
                return Err(NetFailure::new(
                    NetError::CertCommonNameInvalid,
                    format!("hostname {host} rejected by verifier"),
                ));
            }
        }

        tracing::debug!(
            host,
            version = tls.ssl().version_str(),
            "TLS handshake complete"
        );
        Ok(tls)
    }
}

fn is_self_signed(result: X509VerifyResult) -> bool {
    matches!(
        result,
        Err(X509VerifyError::DEPTH_ZERO_SELF_SIGNED_CERT | X509VerifyError::SELF_SIGNED_CERT_IN_CHAIN)
    )
}

/// Kind for a failed handshake: the certificate verdict first, then the
/// reason codes on the BoringSSL error stack.
fn classify_handshake(err: &HandshakeError<TcpStream>) -> NetError {
    if let Some(Err(verdict)) = err.ssl().map(|ssl| ssl.verify_result()) {
        return verify_error_kind(verdict);
    }

    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(stack) = cause.downcast_ref::<boring::error::ErrorStack>() {
            if let Some(kind) = stack.errors().iter().find_map(|e| e.reason().and_then(reason_kind)) {
                return kind;
            }
        }
        source = cause.source();
    }
    NetError::SslProtocolError
}

fn verify_error_kind(verdict: X509VerifyError) -> NetError {
    match verdict {
        X509VerifyError::HOSTNAME_MISMATCH | X509VerifyError::IP_ADDRESS_MISMATCH => {
            NetError::CertCommonNameInvalid
        }
        X509VerifyError::DEPTH_ZERO_SELF_SIGNED_CERT
        | X509VerifyError::SELF_SIGNED_CERT_IN_CHAIN
        | X509VerifyError::UNABLE_TO_GET_ISSUER_CERT
        | X509VerifyError::UNABLE_TO_GET_ISSUER_CERT_LOCALLY
        | X509VerifyError::UNABLE_TO_VERIFY_LEAF_SIGNATURE
        | X509VerifyError::CERT_UNTRUSTED => NetError::CertAuthorityInvalid,
        _ => NetError::SslProtocolError,
    }
}

fn reason_kind(reason: &str) -> Option<NetError> {
    match reason {
        "UNSUPPORTED_PROTOCOL"
        | "TLSV1_ALERT_PROTOCOL_VERSION"
        | "WRONG_VERSION_NUMBER"
        | "NO_SUPPORTED_VERSIONS_ENABLED"
        | "NO_SHARED_CIPHER"
        | "NO_CIPHERS_AVAILABLE" => Some(NetError::SslVersionOrCipherMismatch),
        "SSLV3_ALERT_BAD_CERTIFICATE"
        | "TLSV1_ALERT_UNKNOWN_CA"
        | "TLSV1_ALERT_CERTIFICATE_REQUIRED" => Some(NetError::BadSslClientAuthCert),
        _ => None,
    }
}

/// SNI must not be sent for IP literals (RFC 6066).
pub fn should_set_sni(host: &str) -> bool {
    host.parse::<std::net::IpAddr>().is_err()
}

fn read_store(kind: &str, location: &StoreLocation) -> Result<Vec<u8>, ClientError> {
    fs::read(&location.path).map_err(|e| {
        ClientError::configuration_with(
            format!("cannot read {kind} {}", location.path.display()),
            e,
        )
    })
}

fn is_pem(data: &[u8]) -> bool {
    data.windows(PEM_MARKER.len()).any(|w| w == PEM_MARKER)
}

/// Trust store: PEM bundle, single DER certificate, or PKCS#12.
fn load_trust_store(
    builder: &mut SslConnectorBuilder,
    location: &StoreLocation,
) -> Result<(), ClientError> {
    let data = read_store("trust store", location)?;
    let path = location.path.display();
    let invalid = |e: boring::error::ErrorStack| {
        ClientError::configuration_with(format!("invalid trust store {path}"), e)
    };

    let certs = if is_pem(&data) {
        X509::stack_from_pem(&data).map_err(invalid)?
    } else if let Ok(cert) = X509::from_der(&data) {
        vec![cert]
    } else {
        let parsed = Pkcs12::from_der(&data)
            .and_then(|p12| p12.parse(location.password.expose()))
            .map_err(invalid)?;
        let mut certs = vec![parsed.cert];
        if let Some(chain) = parsed.chain {
            certs.extend(chain);
        }
        certs
    };

    if certs.is_empty() {
        return Err(ClientError::configuration(format!(
            "trust store {path} holds no certificates"
        )));
    }

    let count = certs.len();
    let store = builder.cert_store_mut();
    for cert in certs {
        store.add_cert(cert).map_err(invalid)?;
    }
    tracing::debug!(path = %path, certificates = count, "loaded trust store");
    Ok(())
}

/// Key store: PKCS#12, or PEM holding the certificate chain and a private key.
fn load_key_store(
    builder: &mut SslConnectorBuilder,
    location: &StoreLocation,
) -> Result<(), ClientError> {
    let data = read_store("key store", location)?;
    let path = location.path.display();
    let invalid = |e: boring::error::ErrorStack| {
        ClientError::configuration_with(format!("invalid key store {path}"), e)
    };

    let (cert, pkey, chain) = if is_pem(&data) {
        let mut certs = X509::stack_from_pem(&data).map_err(invalid)?.into_iter();
        let cert = certs.next().ok_or_else(|| {
            ClientError::configuration(format!("key store {path} holds no certificate"))
        })?;
        let password = location.password.expose();
        let pkey = if password.is_empty() {
            PKey::private_key_from_pem(&data)
        } else {
            PKey::private_key_from_pem_passphrase(&data, password.as_bytes())
        }
        .map_err(invalid)?;
        (cert, pkey, certs.collect::<Vec<_>>())
    } else {
        let parsed = Pkcs12::from_der(&data)
            .and_then(|p12| p12.parse(location.password.expose()))
            .map_err(invalid)?;
        let chain = parsed.chain.map(|c| c.into_iter().collect()).unwrap_or_default();
        (parsed.cert, parsed.pkey, chain)
    };

    builder.set_certificate(&cert).map_err(invalid)?;
    builder.set_private_key(&pkey).map_err(invalid)?;
    for extra in chain {
        builder.add_extra_chain_cert(extra).map_err(invalid)?;
    }
    builder.check_private_key().map_err(invalid)?;
    tracing::debug!(path = %path, "loaded client key store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsVersion;

    #[test]
    fn test_sni_skipped_for_ip_literals() {
        assert!(should_set_sni("db.example"));
        assert!(!should_set_sni("127.0.0.1"));
        assert!(!should_set_sni("::1"));
    }

    #[test]
    fn test_default_settings_build() {
        let connector = TlsConnector::new(&TlsSettings::default());
        assert!(connector.is_ok());
    }

    #[test]
    fn test_each_version_can_be_pinned() {
        for protocol in [TlsVersion::Tls1_2, TlsVersion::Tls1_3] {
            let settings = TlsSettings { protocol, ..Default::default() };
            assert!(TlsConnector::new(&settings).is_ok());
        }
    }

    #[test]
    fn test_missing_trust_store_is_configuration_error() {
        let settings = TlsSettings {
            trust_store: Some(StoreLocation::new("/nonexistent/couchnet/trust.p12", "changeit")),
            ..Default::default()
        };
        let err = TlsConnector::new(&settings).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("trust store"));
    }

    #[test]
    fn test_self_signed_waiver_is_narrow() {
        assert!(is_self_signed(Err(X509VerifyError::DEPTH_ZERO_SELF_SIGNED_CERT)));
        assert!(is_self_signed(Err(X509VerifyError::SELF_SIGNED_CERT_IN_CHAIN)));
        assert!(!is_self_signed(Err(X509VerifyError::HOSTNAME_MISMATCH)));
        assert!(!is_self_signed(Err(X509VerifyError::IP_ADDRESS_MISMATCH)));
        assert!(!is_self_signed(Err(X509VerifyError::CERT_HAS_EXPIRED)));
        assert!(!is_self_signed(Ok(())));
    }

    #[test]
    fn test_verify_error_kinds() {
        assert_eq!(
            verify_error_kind(X509VerifyError::IP_ADDRESS_MISMATCH),
            NetError::CertCommonNameInvalid
        );
        assert_eq!(
            verify_error_kind(X509VerifyError::DEPTH_ZERO_SELF_SIGNED_CERT),
            NetError::CertAuthorityInvalid
        );
        assert_eq!(verify_error_kind(X509VerifyError::CERT_HAS_EXPIRED), NetError::SslProtocolError);
    }

    #[test]
    fn test_reason_kinds() {
        assert_eq!(
            reason_kind("TLSV1_ALERT_PROTOCOL_VERSION"),
            Some(NetError::SslVersionOrCipherMismatch)
        );
        assert_eq!(reason_kind("TLSV1_ALERT_UNKNOWN_CA"), Some(NetError::BadSslClientAuthCert));
        assert_eq!(reason_kind("CERTIFICATE_VERIFY_FAILED"), None);
    }

    #[test]
    fn test_pem_detection() {
        assert!(is_pem(b"junk\n-----BEGIN CERTIFICATE-----\n"));
        assert!(!is_pem(&[0x30, 0x82, 0x01, 0x0a]));
    }
}
