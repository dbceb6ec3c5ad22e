//! Function-to-mesh reconciler
//!
//! One registrator invocation converges the mesh catalog toward the cloud
//! function inventory. A timer event triggers a full-sync diff; a
//! cloud-trail event narrows the work to a single function. Each resulting
//! [`Event`](event::Event) reconciles independently and failures aggregate
//! without aborting the batch.

pub mod event;
pub mod trigger;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::functions::FunctionClient;
use crate::mesh::MeshClient;
use crate::store::ParamStore;
use trigger::{AwsEvent, SyncOutcome};

/// Registrator configuration, loaded from the environment by the CLI.
#[derive(Clone, Debug, Default)]
pub struct RegistratorConfig {
    /// Catalog node all managed services are registered under
    pub node_name: String,
    /// When set, only functions tagged for this datacenter are managed
    pub datacenter: String,
    /// Whether the mesh is an enterprise deployment
    pub is_enterprise: bool,
    /// Admin partitions the registrator manages (enterprise only)
    pub partitions: HashSet<String>,
    /// Parameter-store prefix for mTLS material; empty disables mTLS
    /// management
    pub extension_data_prefix: String,
}

/// The registrator's dependencies: configuration plus the mesh, function
/// inventory, and parameter store clients.
pub struct Environment {
    pub config: RegistratorConfig,
    pub mesh: Arc<dyn MeshClient>,
    pub functions: Arc<dyn FunctionClient>,
    pub store: Arc<dyn ParamStore>,
}

impl Environment {
    /// Bundle configuration and clients into a processing environment.
    pub fn new(
        config: RegistratorConfig,
        mesh: Arc<dyn MeshClient>,
        functions: Arc<dyn FunctionClient>,
        store: Arc<dyn ParamStore>,
    ) -> Self {
        Self {
            config,
            mesh,
            functions,
            store,
        }
    }

    /// Whether mTLS material is written to the parameter store.
    pub fn is_managing_tls(&self) -> bool {
        !self.config.extension_data_prefix.is_empty()
    }

    /// Turn a raw invocation payload into reconciliation events.
    ///
    /// `aws.events` (the sync timer) triggers a full diff; `aws.lambda`
    /// carries a cloud-trail detail about one function.
    pub async fn get_events(&self, raw: serde_json::Value) -> Result<SyncOutcome> {
        let source = raw
            .get("source")
            .and_then(|s| s.as_str())
            .ok_or_else(|| Error::config("missing event source"))?
            .to_string();

        info!(source = %source, "received event");
        match source.as_str() {
            "aws.events" => self.full_sync_data().await,
            "aws.lambda" => {
                let event: AwsEvent = serde_json::from_value(raw)?;
                let events = self.aws_event_to_events(&event).await?;
                Ok(SyncOutcome {
                    events,
                    errors: Vec::new(),
                })
            }
            other => Err(Error::config(format!(
                "unprocessable event source {other:?}"
            ))),
        }
    }

    /// Process one invocation: derive events and reconcile each, aggregating
    /// per-event failures.
    pub async fn run(&self, raw: serde_json::Value) -> Result<()> {
        let outcome = self.get_events(raw).await?;
        info!(count = outcome.events.len(), "processing events");

        let mut errors = outcome.errors;
        for event in &outcome.events {
            if let Err(err) = event.reconcile(self).await {
                warn!(
                    error = %err,
                    identifier = %event.identifier(),
                    "error reconciling event"
                );
                errors.push(err);
            }
        }

        Error::aggregate(errors)
    }
}
