//! mTLS material envelope shared between the registrator and the extension
//!
//! The registrator writes one [`ExtensionData`] JSON document per managed
//! service into the parameter store; the extension reads it back on a timer.
//! Comparison is structural: a re-fetch that compares equal to the cached
//! copy must not reconfigure the proxy.

use serde::{Deserialize, Serialize};

/// Everything a function needs to call services in the mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionData {
    /// TLS certificate private key in PEM format
    #[serde(rename = "privateKeyPEM")]
    pub private_key_pem: String,
    /// TLS certificate in PEM format
    #[serde(rename = "certPEM")]
    pub cert_pem: String,
    /// TLS root CA certificate in PEM format
    #[serde(rename = "rootCertPEM")]
    pub root_cert_pem: String,
    /// Trust domain the service belongs to
    #[serde(rename = "trustDomain")]
    pub trust_domain: String,
    /// Peered meshes, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<Peer>>,
}

/// A peered mesh and its trust domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Name of the peer
    pub name: String,
    /// Trust domain of the peer
    #[serde(rename = "trustDomain")]
    pub trust_domain: String,
}
