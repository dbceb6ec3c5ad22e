//! Cloud events into reconciliation events
//!
//! Two entry points: a cloud-trail event about one function
//! ([`Environment::aws_event_to_events`]) and the timer-driven full sync
//! ([`Environment::full_sync_data`]), which diffs the entire function
//! inventory against the managed entries of the mesh catalog.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::functions::LambdaFunction;
use crate::mesh::{RequestOptions, MANAGED_TAG};
use crate::service::{EnterpriseMeta, Service};

use super::event::{DeleteEvent, Event, LambdaArguments, UpsertEvent};
use super::Environment;

const ENABLED_TAG: &str = "serverless.consul.hashicorp.com/v1alpha1/lambda/enabled";
const PAYLOAD_PASSTHROUGH_TAG: &str =
    "serverless.consul.hashicorp.com/v1alpha1/lambda/payload-passthrough";
const INVOCATION_MODE_TAG: &str =
    "serverless.consul.hashicorp.com/v1alpha1/lambda/invocation-mode";
const DATACENTER_TAG: &str = "serverless.consul.hashicorp.com/v1alpha1/lambda/datacenter";
const PARTITION_TAG: &str = "serverless.consul.hashicorp.com/v1alpha1/lambda/partition";
const NAMESPACE_TAG: &str = "serverless.consul.hashicorp.com/v1alpha1/lambda/namespace";
const ALIASES_TAG: &str = "serverless.consul.hashicorp.com/v1alpha1/lambda/aliases";

const SYNCHRONOUS_INVOCATION: &str = "SYNCHRONOUS";
const ASYNCHRONOUS_INVOCATION: &str = "ASYNCHRONOUS";

// `,` is not a legal tag-value character, so aliases join on `+`.
const LIST_SEPARATOR: char = '+';

/// A cloud-trail event about one function.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AwsEvent {
    #[serde(default)]
    pub detail: Detail,
}

/// The cloud-trail detail block.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Detail {
    pub event_id: String,
    pub error_code: String,
    pub event_name: String,
    pub response_elements: ResponseElements,
    pub request_parameters: RequestParameters,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseElements {
    pub function_arn: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestParameters {
    pub function_name: String,
    pub resource: String,
}

/// Events produced by one sync, plus per-function failures that did not
/// abort it.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub events: Vec<Event>,
    pub errors: Vec<Error>,
}

/// Events grouped by enterprise scope and keyed by service name. `None` is
/// the OSS scope.
type EventMap = HashMap<Option<EnterpriseMeta>, HashMap<String, Event>>;

/// Managed catalog services per enterprise scope.
type ServiceMap = HashMap<Option<EnterpriseMeta>, HashSet<String>>;

impl Environment {
    /// Convert a cloud-trail event into the reconciliation events for the
    /// function it names.
    pub async fn aws_event_to_events(&self, event: &AwsEvent) -> Result<Vec<Event>> {
        let detail = &event.detail;
        let arn = match detail.event_name.as_str() {
            "CreateFunction20150331" | "CreateFunction" => {
                detail.response_elements.function_arn.clone()
            }
            "TagResource20170331v2" | "TagResource20170331" | "TagResource"
            | "UntagResource20170331v2" | "UntagResource20170331" | "UntagResource" => {
                detail.request_parameters.resource.clone()
            }
            other => return Err(Error::UnsupportedEvent(other.to_string())),
        };

        if arn.is_empty() {
            return Err(Error::ArnUndefined);
        }

        let function = self.functions.get_function(&arn).await?;
        self.lambda_events(&function)
    }

    /// Inspect one function's tags and produce the events required to
    /// reconcile it, or none when the function is out of this registrator's
    /// scope.
    pub fn lambda_events(&self, function: &LambdaFunction) -> Result<Vec<Event>> {
        let tags = &function.tags;
        let datacenter = tags.get(DATACENTER_TAG).cloned().unwrap_or_default();

        // When pinned to a datacenter, ignore functions from any other.
        if !self.config.datacenter.is_empty() && self.config.datacenter != datacenter {
            debug!(
                service = %function.name,
                function_datacenter = %datacenter,
                datacenter = %self.config.datacenter,
                "ignoring function from remote datacenter"
            );
            return Ok(Vec::new());
        }

        let enabled = tags.get(ENABLED_TAG).map(|v| v == "true").unwrap_or(false);
        let payload_passthrough = tags
            .get(PAYLOAD_PASSTHROUGH_TAG)
            .map(|v| v == "true")
            .unwrap_or(false);

        let invocation_mode = match tags.get(INVOCATION_MODE_TAG) {
            None => SYNCHRONOUS_INVOCATION.to_string(),
            Some(mode)
                if mode == SYNCHRONOUS_INVOCATION || mode == ASYNCHRONOUS_INVOCATION =>
            {
                mode.clone()
            }
            Some(mode) => return Err(Error::InvalidInvocationMode(mode.clone())),
        };

        let mut enterprise_meta = EnterpriseMeta::new(
            tags.get(PARTITION_TAG).map(String::as_str).unwrap_or(""),
            tags.get(NAMESPACE_TAG).map(String::as_str).unwrap_or(""),
        );
        if !self.config.is_enterprise && enterprise_meta.is_some() {
            return Err(Error::NotEnterprise);
        }
        if self.config.is_enterprise {
            if enterprise_meta.is_none() {
                enterprise_meta = EnterpriseMeta::new("default", "default");
            }
            // Partitions outside the configured set are someone else's.
            if let Some(em) = &enterprise_meta {
                if !self.config.partitions.contains(&em.partition) {
                    return Ok(Vec::new());
                }
            }
        }

        let aliases: Vec<&str> = tags
            .get(ALIASES_TAG)
            .map(|raw| raw.split(LIST_SEPARATOR).collect())
            .unwrap_or_default();

        let service = Service {
            name: function.name.clone(),
            datacenter,
            enterprise_meta,
            ..Service::default()
        };

        let base = if enabled {
            Event::Upsert(UpsertEvent {
                service,
                lambda: LambdaArguments {
                    arn: function.arn.clone(),
                    payload_passthrough,
                    invocation_mode,
                },
            })
        } else {
            Event::Delete(DeleteEvent { service })
        };

        let mut events = vec![base.clone()];
        for alias in aliases {
            events.push(base.with_alias(alias));
        }
        Ok(events)
    }

    /// Diff the entire function inventory against the mesh catalog.
    ///
    /// Per-function failures collect in the outcome without aborting the
    /// sync; a failure to list either side aborts.
    pub async fn full_sync_data(&self) -> Result<SyncOutcome> {
        let (lambdas, errors) = self.function_events().await?;
        debug!(scopes = lambdas.len(), "computed function events");

        let scopes = self.sync_scopes().await?;
        let catalog = self.catalog_services(&scopes).await?;
        debug!(scopes = catalog.len(), "retrieved managed catalog services");

        let mut events = construct_upsert_events(&lambdas, &catalog);
        events.extend(construct_delete_events(&lambdas, &catalog));
        Ok(SyncOutcome { events, errors })
    }

    /// Compute per-function events for the whole inventory, grouped by
    /// enterprise scope.
    async fn function_events(&self) -> Result<(EventMap, Vec<Error>)> {
        let functions = self.functions.list_functions().await?;

        let mut lambdas = EventMap::new();
        let mut errors = Vec::new();
        for function in functions.values() {
            match self.lambda_events(function) {
                Ok(events) => {
                    for event in events {
                        lambdas
                            .entry(event.enterprise_meta().cloned())
                            .or_default()
                            .insert(event.service_name().to_string(), event);
                    }
                }
                Err(err) => errors.push(err),
            }
        }
        Ok((lambdas, errors))
    }

    /// The enterprise scopes this registrator synchronizes: every configured
    /// partition crossed with the namespaces that exist in it. OSS is the
    /// single `None` scope.
    async fn sync_scopes(&self) -> Result<Vec<Option<EnterpriseMeta>>> {
        if !self.config.is_enterprise {
            return Ok(vec![None]);
        }

        let mut scopes = Vec::new();
        for partition in &self.config.partitions {
            let namespaces = self.mesh.list_namespaces(partition).await?;
            for namespace in namespaces {
                scopes.push(EnterpriseMeta::new(partition, &namespace));
            }
        }
        Ok(scopes)
    }

    /// Catalog services carrying the managed tag, per scope.
    async fn catalog_services(&self, scopes: &[Option<EnterpriseMeta>]) -> Result<ServiceMap> {
        let mut services = ServiceMap::new();
        for scope in scopes {
            let opts = match scope {
                Some(em) => RequestOptions::for_scope(&em.partition, &em.namespace),
                None => RequestOptions::default(),
            };

            debug!("querying mesh catalog");
            let listed = self.mesh.list_services(&opts).await?;
            let managed = listed
                .into_iter()
                .filter(|(_, tags)| tags.iter().any(|tag| tag == MANAGED_TAG))
                .map(|(name, _)| name)
                .collect();
            services.insert(scope.clone(), managed);
        }
        Ok(services)
    }
}

/// Upserts for functions missing from the catalog, and deletes for disabled
/// functions still present in it.
fn construct_upsert_events(lambdas: &EventMap, catalog: &ServiceMap) -> Vec<Event> {
    let mut events = Vec::new();
    for (scope, scoped) in lambdas {
        for (name, event) in scoped {
            let in_catalog = catalog
                .get(scope)
                .map(|services| services.contains(name))
                .unwrap_or(false);
            match event {
                Event::Upsert(_) if !in_catalog => events.push(event.clone()),
                Event::Delete(_) if in_catalog => events.push(event.clone()),
                _ => {}
            }
        }
    }
    events
}

/// Synthetic deletes for managed catalog entries with no matching function.
fn construct_delete_events(lambdas: &EventMap, catalog: &ServiceMap) -> Vec<Event> {
    let mut events = Vec::new();
    for (scope, services) in catalog {
        for name in services {
            let has_function = lambdas
                .get(scope)
                .map(|scoped| scoped.contains_key(name))
                .unwrap_or(false);
            if !has_function {
                events.push(Event::Delete(DeleteEvent {
                    service: Service {
                        name: name.clone(),
                        enterprise_meta: scope.clone(),
                        ..Service::default()
                    },
                }));
            }
        }
    }
    events
}
