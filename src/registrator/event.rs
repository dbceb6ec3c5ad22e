//! Reconciliation events
//!
//! A reconciliation batch is a list of [`Event`]s, each converging the mesh
//! to the state of one function (or one alias of one function). Events are
//! idempotent against the catalog state they observe and order within a
//! batch is irrelevant.

use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::extension_data::ExtensionData;
use crate::mesh::{
    AgentService, CatalogDeregistration, CatalogRegistration, EnvoyExtension, RequestOptions,
    ServiceDefaults, AWS_LAMBDA_EXTENSION, MANAGED_TAG, SERVICE_DEFAULTS,
};
use crate::service::{EnterpriseMeta, Service};

use super::Environment;

/// Envoy AWS Lambda extension arguments carried by an upsert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LambdaArguments {
    /// Function ARN the mesh service invokes
    pub arn: String,
    /// Pass the payload through instead of wrapping it in JSON
    pub payload_passthrough: bool,
    /// `SYNCHRONOUS` or `ASYNCHRONOUS`
    pub invocation_mode: String,
}

/// Register or update one function-backed mesh service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpsertEvent {
    pub service: Service,
    pub lambda: LambdaArguments,
}

/// Remove one function-backed mesh service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteEvent {
    pub service: Service,
}

/// One reconciliation step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Upsert(UpsertEvent),
    Delete(DeleteEvent),
}

impl Event {
    /// Identifier used in logs: the ARN for upserts, the service name for
    /// deletes.
    pub fn identifier(&self) -> &str {
        match self {
            Event::Upsert(e) => &e.lambda.arn,
            Event::Delete(e) => &e.service.name,
        }
    }

    /// Name of the mesh service this event targets.
    pub fn service_name(&self) -> &str {
        match self {
            Event::Upsert(e) => &e.service.name,
            Event::Delete(e) => &e.service.name,
        }
    }

    /// Enterprise scope of the targeted service.
    pub fn enterprise_meta(&self) -> Option<&EnterpriseMeta> {
        match self {
            Event::Upsert(e) => e.service.enterprise_meta.as_ref(),
            Event::Delete(e) => e.service.enterprise_meta.as_ref(),
        }
    }

    /// Derive the event for one alias of the base function.
    ///
    /// Aliased services are named `<base>-<alias>`; aliased upserts invoke
    /// `<base-arn>:<alias>`.
    pub fn with_alias(&self, alias: &str) -> Event {
        match self {
            Event::Upsert(e) => {
                let mut aliased = e.clone();
                aliased.service.name = format!("{}-{alias}", e.service.name);
                aliased.lambda.arn = format!("{}:{alias}", e.lambda.arn);
                Event::Upsert(aliased)
            }
            Event::Delete(e) => {
                let mut aliased = e.clone();
                aliased.service.name = format!("{}-{alias}", e.service.name);
                Event::Delete(aliased)
            }
        }
    }

    /// Converge the mesh to this event's desired state.
    pub async fn reconcile(&self, env: &Environment) -> Result<()> {
        match self {
            Event::Upsert(e) => e.reconcile(env).await,
            Event::Delete(e) => e.reconcile(env).await,
        }
    }
}

impl UpsertEvent {
    async fn reconcile(&self, env: &Environment) -> Result<()> {
        info!(arn = %self.lambda.arn, "upserting function");
        let opts = RequestOptions::for_service(&self.service);

        debug!(arn = %self.lambda.arn, "storing service defaults config entry");
        env.mesh
            .write_service_defaults(&self.service_defaults(), &opts)
            .await?;

        debug!(arn = %self.lambda.arn, "registering service");
        env.mesh.register(&self.registration(env), &opts).await?;

        self.upsert_tls_data(env, &opts).await
    }

    /// The service-defaults entry is regenerated wholesale on every upsert,
    /// so a plain overwrite without CAS is correct.
    fn service_defaults(&self) -> ServiceDefaults {
        ServiceDefaults {
            kind: SERVICE_DEFAULTS.to_string(),
            name: self.service.name.clone(),
            protocol: "http".to_string(),
            envoy_extensions: vec![EnvoyExtension {
                name: AWS_LAMBDA_EXTENSION.to_string(),
                required: false,
                arguments: json!({
                    "arn": self.lambda.arn,
                    "invocationMode": self.lambda.invocation_mode,
                    "payloadPassthrough": self.lambda.payload_passthrough,
                }),
            }],
        }
    }

    fn registration(&self, env: &Environment) -> CatalogRegistration {
        CatalogRegistration {
            node: env.config.node_name.clone(),
            skip_node_update: true,
            node_meta: HashMap::from([
                ("external-node".to_string(), "true".to_string()),
                ("external-probe".to_string(), "true".to_string()),
            ]),
            service: AgentService {
                id: self.service.name.clone(),
                service: self.service.name.clone(),
                tags: vec![MANAGED_TAG.to_string()],
            },
        }
    }

    async fn upsert_tls_data(&self, env: &Environment, opts: &RequestOptions) -> Result<()> {
        if !env.is_managing_tls() {
            return Ok(());
        }

        debug!(service = %self.service.name, "upserting mTLS data");

        let roots = env
            .mesh
            .ca_roots()
            .await
            .map_err(|err| Error::mesh(format!("failed to retrieve mesh root CA: {err}")))?;
        let root = roots
            .active_root()
            .ok_or_else(|| Error::mesh("failed to find an active CA root cert"))?;

        let leaf = env
            .mesh
            .leaf_cert(&self.service.name, opts)
            .await
            .map_err(|err| {
                Error::mesh(format!(
                    "failed to retrieve leaf cert for {}: {err}",
                    self.service.name
                ))
            })?;

        let data = ExtensionData {
            private_key_pem: leaf.private_key_pem,
            cert_pem: leaf.cert_pem,
            root_cert_pem: root.root_cert_pem.clone(),
            trust_domain: roots.trust_domain.clone(),
            peers: None,
        };
        let payload = serde_json::to_string(&data)?;

        let record = Service {
            name: self.service.name.clone(),
            datacenter: self.service.datacenter.clone(),
            trust_domain: roots.trust_domain,
            enterprise_meta: self.service.enterprise_meta.clone(),
            ..Service::default()
        };
        let key = format!(
            "{}{}",
            env.config.extension_data_prefix,
            record.extension_path()
        );
        env.store.set(&key, &payload).await
    }
}

impl DeleteEvent {
    async fn reconcile(&self, env: &Environment) -> Result<()> {
        info!(service = %self.service.name, "deleting function service from mesh");
        let opts = RequestOptions::for_service(&self.service);

        debug!(service = %self.service.name, "deleting service defaults config entry");
        env.mesh
            .delete_service_defaults(&self.service.name, &opts)
            .await?;

        debug!(service = %self.service.name, "deregistering service");
        env.mesh
            .deregister(
                &CatalogDeregistration {
                    node: env.config.node_name.clone(),
                    service_id: self.service.name.clone(),
                },
                &opts,
            )
            .await?;

        self.delete_tls_data(env).await
    }

    async fn delete_tls_data(&self, env: &Environment) -> Result<()> {
        if !env.is_managing_tls() {
            return Ok(());
        }

        debug!(service = %self.service.name, "deleting mTLS data");
        let key = format!(
            "{}{}",
            env.config.extension_data_prefix,
            self.service.extension_path()
        );
        env.store.delete(&key).await
    }
}
