//! Mesh service identity
//!
//! A [`Service`] names a service in the mesh together with the scope it lives
//! in (datacenter, and for enterprise meshes an admin partition and
//! namespace). From it the proxy derives the two identities that matter on
//! the wire: the SNI hostname presented to the mesh gateway and the SPIFFE
//! URI expected in the peer's leaf certificate.

use crate::error::{Error, Result};

const INTERNAL: &str = "internal";
const INTERNAL_VERSION: &str = "internal-v1";

const DEFAULT_DATACENTER: &str = "dc1";
const DEFAULT_PARTITION: &str = "default";
const DEFAULT_NAMESPACE: &str = "default";

/// Admin partition and namespace scope for enterprise meshes.
///
/// `None` stands for an OSS mesh; both sides of a present meta are always
/// non-empty, so maps keyed by `Option<EnterpriseMeta>` compare structurally.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnterpriseMeta {
    /// Namespace within the partition
    pub namespace: String,
    /// Admin partition
    pub partition: String,
}

impl EnterpriseMeta {
    /// Canonicalizing constructor.
    ///
    /// Returns `None` when both inputs are empty; otherwise substitutes
    /// `"default"` for any empty side.
    pub fn new(partition: &str, namespace: &str) -> Option<Self> {
        if partition.is_empty() && namespace.is_empty() {
            return None;
        }
        Some(Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace.to_string()
            },
            partition: if partition.is_empty() {
                DEFAULT_PARTITION.to_string()
            } else {
                partition.to_string()
            },
        })
    }
}

/// A service in the mesh, as seen by the extension (an upstream it dials) or
/// by the registrator (a catalog entry it manages).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    /// Service name
    pub name: String,
    /// Local listener port when the service is used as an upstream
    pub port: u16,
    /// Datacenter the service lives in; empty means the local default
    pub datacenter: String,
    /// Trust domain minted by the mesh CA; patched in once known
    pub trust_domain: String,
    /// Optional service subset
    pub subset: String,
    /// Enterprise scope; `None` for OSS
    pub enterprise_meta: Option<EnterpriseMeta>,
}

impl Service {
    /// Parse an unlabeled upstream descriptor.
    ///
    /// Grammar: `name["." ns ["." partition]] ":" port [":" datacenter]`.
    /// A namespace without an explicit partition implies the `default`
    /// partition.
    pub fn parse_upstream(s: &str) -> Result<Service> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 {
            return Err(Error::InvalidUpstream(format!(
                "invalid service format: {s}"
            )));
        }

        let port: u16 = parts[1].parse().map_err(|_| {
            Error::InvalidUpstream(format!("invalid service port: {}", parts[1]))
        })?;

        let qname: Vec<&str> = parts[0].split('.').collect();
        let mut upstream = Service {
            name: qname[0].to_string(),
            port,
            ..Service::default()
        };

        if qname.len() > 1 {
            let partition = if qname.len() > 2 { qname[2] } else { DEFAULT_PARTITION };
            upstream.enterprise_meta = EnterpriseMeta::new(partition, qname[1]);
        }

        if parts.len() > 2 {
            upstream.datacenter = parts[2].to_string();
        }

        Ok(upstream)
    }

    /// Effective namespace; `default` for OSS
    pub fn namespace_or_default(&self) -> &str {
        self.enterprise_meta
            .as_ref()
            .map(|em| em.namespace.as_str())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Effective partition; `default` for OSS
    pub fn partition_or_default(&self) -> &str {
        self.enterprise_meta
            .as_ref()
            .map(|em| em.partition.as_str())
            .unwrap_or(DEFAULT_PARTITION)
    }

    /// Effective datacenter; `dc1` when unset
    pub fn datacenter_or_default(&self) -> &str {
        if self.datacenter.is_empty() {
            DEFAULT_DATACENTER
        } else {
            &self.datacenter
        }
    }

    /// The SNI hostname presented to the mesh gateway for this service.
    ///
    /// Services in the `default` partition use the `internal` infix; any
    /// other partition uses `internal-v1` and carries the partition label.
    pub fn sni(&self) -> String {
        let ns = self.namespace_or_default();
        let ap = self.partition_or_default();
        let dc = self.datacenter_or_default();

        let mut labels: Vec<&str> = Vec::with_capacity(7);
        if !self.subset.is_empty() {
            labels.push(&self.subset);
        }
        labels.push(&self.name);
        labels.push(ns);
        if ap == DEFAULT_PARTITION {
            labels.push(dc);
            labels.push(INTERNAL);
        } else {
            labels.push(ap);
            labels.push(dc);
            labels.push(INTERNAL_VERSION);
        }
        labels.push(&self.trust_domain);
        labels.join(".")
    }

    /// The SPIFFE URI expected in this service's leaf certificate.
    ///
    /// The `/ap/<partition>` segment is present only for non-default
    /// partitions so OSS identities never carry a partition label, while
    /// exported partitions from peered enterprise meshes still resolve.
    pub fn spiffe_id(&self) -> String {
        let ap = self.partition_or_default();
        let partition_segment = if ap == DEFAULT_PARTITION {
            String::new()
        } else {
            format!("/ap/{ap}")
        };
        format!(
            "spiffe://{}{}/ns/{}/dc/{}/svc/{}",
            self.trust_domain,
            partition_segment,
            self.namespace_or_default(),
            self.datacenter_or_default(),
            self.name,
        )
    }

    /// Parameter-store key suffix for this service's mTLS record
    pub fn extension_path(&self) -> String {
        format!(
            "/{}/{}/{}",
            self.partition_or_default(),
            self.namespace_or_default(),
            self.name
        )
    }
}
