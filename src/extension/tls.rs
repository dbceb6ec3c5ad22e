//! Outbound mTLS toward the mesh gateway
//!
//! The extension dials the gateway with the client certificate from its
//! cached mTLS material and presents the upstream's SNI. Hostname
//! verification does not apply — mesh leaf certificates carry a SPIFFE URI
//! SAN, not a DNS name — so the installed [`SpiffeVerifier`] keeps webpki's
//! chain validation against the cached root CA and replaces the name check
//! with a case-insensitive match of the leaf's first URI SAN against the
//! expected SPIFFE ID.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, OtherError, RootCertStore,
    SignatureScheme,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::prelude::GeneralName;

use crate::error::{Error, Result};
use crate::extension_data::ExtensionData;

/// Peer identity assertion failure: the presented leaf did not carry the
/// expected SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unexpected SPIFFE identity: expected {expected}, presented {presented}")]
pub struct SpiffeMismatch {
    /// SPIFFE ID derived from the upstream
    pub expected: String,
    /// First URI SAN found in the peer leaf, empty if none
    pub presented: String,
}

/// TLS material parsed once per extension-data update.
///
/// Dials reuse the DER forms; nothing is re-parsed per connection.
pub(crate) struct TlsMaterial {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
}

impl TlsMaterial {
    /// Parse the PEM blobs of an [`ExtensionData`] snapshot.
    pub(crate) fn from_data(data: &ExtensionData) -> Result<Self> {
        let chain = rustls_pemfile::certs(&mut data.cert_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::tls_material(format!("failed to parse certificate: {err}")))?;
        if chain.is_empty() {
            return Err(Error::tls_material("no certificate found in PEM data"));
        }

        let key = rustls_pemfile::private_key(&mut data.private_key_pem.as_bytes())
            .map_err(|err| Error::tls_material(format!("failed to parse private key: {err}")))?
            .ok_or_else(|| Error::tls_material("no private key found in PEM data"))?;

        let mut roots = RootCertStore::empty();
        for root in rustls_pemfile::certs(&mut data.root_cert_pem.as_bytes()) {
            let root = root
                .map_err(|err| Error::tls_material(format!("failed to parse root CA: {err}")))?;
            roots
                .add(root)
                .map_err(|err| Error::tls_material(format!("failed to add root CA: {err}")))?;
        }
        if roots.is_empty() {
            return Err(Error::tls_material("no root CA certificate found in PEM data"));
        }

        Ok(Self {
            chain,
            key,
            roots: Arc::new(roots),
        })
    }

    /// Build a client TLS config that presents our certificate and asserts
    /// the given peer SPIFFE ID.
    pub(crate) fn client_config(&self, expected_spiffe_id: &str) -> Result<ClientConfig> {
        let verifier = SpiffeVerifier::new(self.roots.clone(), expected_spiffe_id.to_string())?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|err| Error::tls_material(format!("invalid client key pair: {err}")))
    }
}

/// Connect to the mesh gateway and wrap the stream in TLS with the given
/// config and SNI.
pub(crate) async fn dial_gateway(
    gateway_uri: &str,
    sni: &str,
    config: ClientConfig,
) -> Result<TlsStream<TcpStream>> {
    debug!(gateway = %gateway_uri, sni = %sni, "dialing mesh gateway");

    let tcp = TcpStream::connect(gateway_uri).await?;
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|err| Error::tls_material(format!("invalid SNI {sni}: {err}")))?;
    let connector = TlsConnector::from(Arc::new(config));
    Ok(connector.connect(server_name, tcp).await?)
}

/// Server certificate verifier for mesh peers.
///
/// Delegates chain validation (all presented certificates beyond the first
/// are intermediates) and signature checks to a [`WebPkiServerVerifier`]
/// over the cached mesh root CA, then asserts the peer's SPIFFE identity.
/// The webpki hostname check is the one part deliberately not enforced: the
/// SNI routes through the gateway and never appears in the leaf.
#[derive(Debug)]
pub struct SpiffeVerifier {
    inner: Arc<WebPkiServerVerifier>,
    expected: String,
}

impl SpiffeVerifier {
    /// Create a verifier over the given roots asserting `expected`.
    pub fn new(roots: Arc<RootCertStore>, expected: String) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|err| Error::tls_material(format!("failed to build verifier: {err}")))?;
        Ok(Self { inner, expected })
    }

    fn assert_spiffe_id(&self, end_entity: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        let (_, cert) = x509_parser::parse_x509_certificate(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

        let presented = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .and_then(|san| {
                san.value.general_names.iter().find_map(|name| match name {
                    GeneralName::URI(uri) => Some((*uri).to_string()),
                    _ => None,
                })
            })
            .unwrap_or_default();

        if presented.eq_ignore_ascii_case(&self.expected) {
            Ok(())
        } else {
            Err(rustls::Error::Other(OtherError(Arc::new(SpiffeMismatch {
                expected: self.expected.clone(),
                presented,
            }))))
        }
    }
}

impl ServerCertVerifier for SpiffeVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        // Chain validity is mandatory; only the name check is replaced by
        // the SPIFFE assertion below. webpki verifies the chain before the
        // name, so a name error implies a trusted chain.
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => {}
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {}
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => {}
            Err(err) => return Err(err),
        }

        self.assert_spiffe_id(end_entity)?;
        Ok(ServerCertVerified::assertion())
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

/// Certificate minting helpers shared by TLS and extension tests.
#[cfg(test)]
pub(crate) mod testing {
    use rcgen::{
        string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType,
        DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    };

    /// Self-signed CA that can issue SPIFFE leaves.
    pub(crate) struct TestCa {
        pub(crate) cert_pem: String,
        key_pem: String,
    }

    impl TestCa {
        pub(crate) fn new() -> Self {
            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(
                DnType::CommonName,
                DnValue::Utf8String("test mesh ca".to_string()),
            );
            params.distinguished_name = dn;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::DigitalSignature,
            ];

            let key_pair = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key_pair).unwrap();
            Self {
                cert_pem: cert.pem(),
                key_pem: key_pair.serialize_pem(),
            }
        }

        /// Issue a leaf whose only SAN is the given SPIFFE URI.
        pub(crate) fn issue_leaf(&self, spiffe_uri: &str) -> (String, String) {
            let key_pair = KeyPair::generate().unwrap();
            let mut params = CertificateParams::default();
            params.subject_alt_names = vec![SanType::URI(
                Ia5String::try_from(spiffe_uri.to_string()).unwrap(),
            )];

            let ca_key = KeyPair::from_pem(&self.key_pem).unwrap();
            let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).unwrap();
            let cert = params.signed_by(&key_pair, &issuer).unwrap();
            (cert.pem(), key_pair.serialize_pem())
        }
    }
}
