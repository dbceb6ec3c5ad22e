//! Mesh catalog, config entries, and connect CA
//!
//! The registrator's view of the mesh HTTP API: service-defaults config
//! entries, catalog registration, the connect CA (roots and per-service
//! leaves), and namespace listing for enterprise meshes. [`MeshClient`] is
//! the seam; [`HttpMeshClient`] talks to a real agent.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::service::Service;

/// Tag attached to every catalog entry the registrator owns. The full-sync
/// diff only ever considers entries carrying it.
pub const MANAGED_TAG: &str = "managed-by-lambda-registrator";

/// Config entry kind for service defaults.
pub const SERVICE_DEFAULTS: &str = "service-defaults";

/// Envoy extension name for Lambda-backed services.
pub const AWS_LAMBDA_EXTENSION: &str = "builtin/aws/lambda";

/// Datacenter/partition/namespace scoping applied to mesh requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Target datacenter; empty uses the agent's local datacenter
    pub datacenter: String,
    /// Admin partition; empty on OSS
    pub partition: String,
    /// Namespace; empty on OSS
    pub namespace: String,
}

impl RequestOptions {
    /// Scope derived from a service's datacenter and enterprise meta.
    pub fn for_service(service: &Service) -> Self {
        let mut opts = Self {
            datacenter: service.datacenter.clone(),
            ..Self::default()
        };
        if let Some(em) = &service.enterprise_meta {
            opts.partition = em.partition.clone();
            opts.namespace = em.namespace.clone();
        }
        opts
    }

    /// Scope for one partition/namespace pair (full-sync catalog listing).
    pub fn for_scope(partition: &str, namespace: &str) -> Self {
        Self {
            datacenter: String::new(),
            partition: partition.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

/// A service-defaults config entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefaults {
    #[serde(rename = "Kind")]
    pub kind: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "EnvoyExtensions", default, skip_serializing_if = "Vec::is_empty")]
    pub envoy_extensions: Vec<EnvoyExtension>,
}

/// One envoy extension attached to a config entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvoyExtension {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Required")]
    pub required: bool,
    #[serde(rename = "Arguments")]
    pub arguments: serde_json::Value,
}

/// Catalog registration request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogRegistration {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "SkipNodeUpdate")]
    pub skip_node_update: bool,
    #[serde(rename = "NodeMeta")]
    pub node_meta: HashMap<String, String>,
    #[serde(rename = "Service")]
    pub service: AgentService,
}

/// Service payload of a catalog registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
}

/// Catalog deregistration request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogDeregistration {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "ServiceID")]
    pub service_id: String,
}

/// Connect CA root list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaRootList {
    #[serde(rename = "ActiveRootID")]
    pub active_root_id: String,
    #[serde(rename = "TrustDomain")]
    pub trust_domain: String,
    #[serde(rename = "Roots", default)]
    pub roots: Vec<CaRoot>,
}

impl CaRootList {
    /// The root whose ID matches `ActiveRootID`, if present.
    pub fn active_root(&self) -> Option<&CaRoot> {
        self.roots.iter().find(|root| root.id == self.active_root_id)
    }
}

/// One connect CA root certificate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaRoot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "RootCert")]
    pub root_cert_pem: String,
    #[serde(rename = "Active", default)]
    pub active: bool,
}

/// A service leaf certificate issued by the connect CA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeafCert {
    #[serde(rename = "CertPEM")]
    pub cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    pub private_key_pem: String,
}

#[derive(Deserialize)]
struct Namespace {
    #[serde(rename = "Name")]
    name: String,
}

/// Mesh operations used by the registrator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshClient: Send + Sync {
    /// Write (overwrite) a service-defaults config entry.
    async fn write_service_defaults(
        &self,
        entry: &ServiceDefaults,
        opts: &RequestOptions,
    ) -> Result<()>;

    /// Delete a service-defaults config entry; deleting a missing entry is
    /// not an error.
    async fn delete_service_defaults(&self, name: &str, opts: &RequestOptions) -> Result<()>;

    /// Register a service in the catalog.
    async fn register(&self, reg: &CatalogRegistration, opts: &RequestOptions) -> Result<()>;

    /// Deregister a service from the catalog; a missing entry is not an
    /// error.
    async fn deregister(&self, dereg: &CatalogDeregistration, opts: &RequestOptions)
        -> Result<()>;

    /// List catalog services with their tags.
    async fn list_services(&self, opts: &RequestOptions) -> Result<HashMap<String, Vec<String>>>;

    /// Fetch the connect CA root list.
    async fn ca_roots(&self) -> Result<CaRootList>;

    /// Issue or fetch the leaf certificate for a service.
    async fn leaf_cert(&self, service: &str, opts: &RequestOptions) -> Result<LeafCert>;

    /// List namespaces within a partition (enterprise only).
    async fn list_namespaces(&self, partition: &str) -> Result<Vec<String>>;
}

/// HTTP implementation of [`MeshClient`] against a mesh agent.
pub struct HttpMeshClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpMeshClient {
    /// Create a client for the agent at `base_url` (e.g.
    /// `http://localhost:8500`), optionally authenticating with a token.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http: reqwest::Client::new(),
        }
    }

    /// Trust an additional CA certificate for the agent connection; mesh
    /// agents commonly serve TLS from a private CA.
    pub fn with_ca_cert(mut self, ca_pem: &str) -> Result<Self> {
        let cert = reqwest::Certificate::from_pem(ca_pem.as_bytes())?;
        self.http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .build()?;
        Ok(self)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.header("X-Consul-Token", token);
        }
        builder
    }

    fn scoped(
        &self,
        method: reqwest::Method,
        path: &str,
        opts: &RequestOptions,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.request(method, path);
        if !opts.datacenter.is_empty() {
            builder = builder.query(&[("dc", opts.datacenter.as_str())]);
        }
        if !opts.partition.is_empty() {
            builder = builder.query(&[("partition", opts.partition.as_str())]);
        }
        if !opts.namespace.is_empty() {
            builder = builder.query(&[("ns", opts.namespace.as_str())]);
        }
        builder
    }

    /// Send, surfacing non-success statuses as mesh errors. When
    /// `allow_not_found` is set a 404 is treated as success.
    async fn send(
        builder: reqwest::RequestBuilder,
        allow_not_found: bool,
    ) -> Result<Option<reqwest::Response>> {
        let res = builder.send().await?;
        let status = res.status();
        if status == reqwest::StatusCode::NOT_FOUND && allow_not_found {
            return Ok(None);
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::mesh(format!("request failed with {status}: {body}")));
        }
        Ok(Some(res))
    }
}

#[async_trait]
impl MeshClient for HttpMeshClient {
    async fn write_service_defaults(
        &self,
        entry: &ServiceDefaults,
        opts: &RequestOptions,
    ) -> Result<()> {
        let builder = self
            .scoped(reqwest::Method::PUT, "/v1/config", opts)
            .json(entry);
        Self::send(builder, false).await?;
        Ok(())
    }

    async fn delete_service_defaults(&self, name: &str, opts: &RequestOptions) -> Result<()> {
        let path = format!("/v1/config/{SERVICE_DEFAULTS}/{name}");
        let builder = self.scoped(reqwest::Method::DELETE, &path, opts);
        Self::send(builder, true).await?;
        Ok(())
    }

    async fn register(&self, reg: &CatalogRegistration, opts: &RequestOptions) -> Result<()> {
        let builder = self
            .scoped(reqwest::Method::PUT, "/v1/catalog/register", opts)
            .json(reg);
        Self::send(builder, false).await?;
        Ok(())
    }

    async fn deregister(
        &self,
        dereg: &CatalogDeregistration,
        opts: &RequestOptions,
    ) -> Result<()> {
        let builder = self
            .scoped(reqwest::Method::PUT, "/v1/catalog/deregister", opts)
            .json(dereg);
        Self::send(builder, true).await?;
        Ok(())
    }

    async fn list_services(&self, opts: &RequestOptions) -> Result<HashMap<String, Vec<String>>> {
        let builder = self.scoped(reqwest::Method::GET, "/v1/catalog/services", opts);
        let res = Self::send(builder, false).await?;
        match res {
            Some(res) => Ok(res.json().await?),
            None => Ok(HashMap::new()),
        }
    }

    async fn ca_roots(&self) -> Result<CaRootList> {
        let builder = self.request(reqwest::Method::GET, "/v1/agent/connect/ca/roots");
        let res = Self::send(builder, false).await?;
        match res {
            Some(res) => Ok(res.json().await?),
            None => Ok(CaRootList::default()),
        }
    }

    async fn leaf_cert(&self, service: &str, opts: &RequestOptions) -> Result<LeafCert> {
        let path = format!("/v1/agent/connect/ca/leaf/{service}");
        let builder = self.scoped(reqwest::Method::GET, &path, opts);
        let res = Self::send(builder, false).await?;
        match res {
            Some(res) => Ok(res.json().await?),
            None => Err(Error::mesh(format!("no leaf certificate for {service}"))),
        }
    }

    async fn list_namespaces(&self, partition: &str) -> Result<Vec<String>> {
        let mut builder = self.request(reqwest::Method::GET, "/v1/namespaces");
        if !partition.is_empty() {
            builder = builder.query(&[("partition", partition)]);
        }
        let res = Self::send(builder, false).await?;
        match res {
            Some(res) => {
                let namespaces: Vec<Namespace> = res.json().await?;
                Ok(namespaces.into_iter().map(|ns| ns.name).collect())
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::EnterpriseMeta;

    #[test]
    fn request_options_from_oss_service_have_no_scope() {
        let service = Service {
            name: "svc".to_string(),
            datacenter: "dc2".to_string(),
            ..Service::default()
        };
        let opts = RequestOptions::for_service(&service);
        assert_eq!(opts.datacenter, "dc2");
        assert!(opts.partition.is_empty());
        assert!(opts.namespace.is_empty());
    }

    #[test]
    fn request_options_carry_enterprise_scope() {
        let service = Service {
            name: "svc".to_string(),
            enterprise_meta: EnterpriseMeta::new("ap1", "ns1"),
            ..Service::default()
        };
        let opts = RequestOptions::for_service(&service);
        assert_eq!(opts.partition, "ap1");
        assert_eq!(opts.namespace, "ns1");
    }

    #[test]
    fn service_defaults_serialize_with_wire_names() {
        let entry = ServiceDefaults {
            kind: SERVICE_DEFAULTS.to_string(),
            name: "lambda-1234".to_string(),
            protocol: "http".to_string(),
            envoy_extensions: vec![EnvoyExtension {
                name: AWS_LAMBDA_EXTENSION.to_string(),
                required: false,
                arguments: serde_json::json!({
                    "arn": "arn:aws:lambda:us-east-1:111111111111:function:lambda-1234",
                    "invocationMode": "SYNCHRONOUS",
                    "payloadPassthrough": false,
                }),
            }],
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["Kind"], "service-defaults");
        assert_eq!(json["Name"], "lambda-1234");
        assert_eq!(json["Protocol"], "http");
        assert_eq!(json["EnvoyExtensions"][0]["Name"], "builtin/aws/lambda");
        assert_eq!(
            json["EnvoyExtensions"][0]["Arguments"]["invocationMode"],
            "SYNCHRONOUS"
        );
    }

    #[test]
    fn ca_root_list_parses_agent_payload() {
        let payload = r#"{
            "ActiveRootID": "c280f2",
            "TrustDomain": "ba471007-e259-d90f-4b39-02af8294c3c6.consul",
            "Roots": [
                {
                    "ID": "old1",
                    "Name": "Consul CA Root Cert",
                    "RootCert": "-----BEGIN CERTIFICATE-----\nOLD\n-----END CERTIFICATE-----",
                    "Active": false
                },
                {
                    "ID": "c280f2",
                    "Name": "Consul CA Root Cert",
                    "RootCert": "-----BEGIN CERTIFICATE-----\nACTIVE\n-----END CERTIFICATE-----",
                    "Active": true
                }
            ]
        }"#;

        let roots: CaRootList = serde_json::from_str(payload).unwrap();
        assert_eq!(roots.roots.len(), 2);
        let active = roots.active_root().expect("active root present");
        assert_eq!(active.id, "c280f2");
        assert!(active.root_cert_pem.contains("ACTIVE"));
    }

    #[test]
    fn active_root_missing_yields_none() {
        let roots = CaRootList {
            active_root_id: "nope".to_string(),
            trust_domain: "td".to_string(),
            roots: vec![CaRoot {
                id: "other".to_string(),
                root_cert_pem: String::new(),
                active: false,
            }],
        };
        assert!(roots.active_root().is_none());
    }

    #[test]
    fn with_ca_cert_rejects_garbage_pem() {
        let client = HttpMeshClient::new("http://localhost:8500", None);
        assert!(client.with_ca_cert("not a certificate").is_err());
    }

    #[tokio::test]
    async fn delete_of_missing_config_entry_succeeds() {
        use axum::routing::delete;

        let app = axum::Router::new().route(
            "/v1/config/service-defaults/{name}",
            delete(|| async { (axum::http::StatusCode::NOT_FOUND, "not found") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpMeshClient::new(format!("http://{addr}"), None);
        client
            .delete_service_defaults("ghost", &RequestOptions::default())
            .await
            .expect("404 is success for delete");
    }

    #[tokio::test]
    async fn list_services_sends_token_and_scope() {
        use axum::extract::Query;
        use axum::http::HeaderMap;
        use axum::routing::get;

        async fn services(
            Query(params): Query<HashMap<String, String>>,
            headers: HeaderMap,
        ) -> axum::Json<serde_json::Value> {
            assert_eq!(params.get("partition").map(String::as_str), Some("ap1"));
            assert_eq!(params.get("ns").map(String::as_str), Some("ns1"));
            assert_eq!(
                headers.get("X-Consul-Token").and_then(|v| v.to_str().ok()),
                Some("secret")
            );
            axum::Json(serde_json::json!({
                "lambda-1234": ["managed-by-lambda-registrator"],
                "web": []
            }))
        }

        let app = axum::Router::new().route("/v1/catalog/services", get(services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpMeshClient::new(format!("http://{addr}"), Some("secret".to_string()));
        let services = client
            .list_services(&RequestOptions::for_scope("ap1", "ns1"))
            .await
            .unwrap();
        assert_eq!(
            services.get("lambda-1234"),
            Some(&vec![MANAGED_TAG.to_string()])
        );
        assert_eq!(services.get("web"), Some(&Vec::new()));
    }
}
