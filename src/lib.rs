//! lambda-mesh - bridge AWS Lambda functions into a Consul service mesh
//!
//! Two subsystems share one data model and one parameter-store protocol:
//!
//! - The **registrator** reconciles the cloud function inventory into the
//!   mesh catalog: it upserts and deletes service entries and
//!   service-defaults config entries, and writes each managed function's
//!   mTLS material into the secure parameter store.
//! - The **extension** is a sidecar co-located with a mesh-enabled function.
//!   It opens one local TCP listener per upstream the function calls,
//!   refreshes its mTLS credentials from the parameter store on a timer, and
//!   wraps outgoing traffic in mutual TLS toward a mesh gateway, enforcing
//!   SPIFFE peer identity.
//!
//! # Modules
//!
//! - [`service`] - mesh service identity: upstream parsing, SNI and SPIFFE
//!   derivation with partition/namespace defaulting
//! - [`extension_data`] - the mTLS material envelope written by the
//!   registrator and read by the extension
//! - [`proxy`] - the multi-listener TCP proxy core
//! - [`extension`] - the sidecar runtime (proxy + credential refresh +
//!   runtime event pump)
//! - [`registrator`] - the reconciliation engine (events, triggers, full
//!   sync)
//! - [`mesh`] - mesh catalog / config-entry / connect-CA client
//! - [`store`] - secure parameter store client
//! - [`functions`] - cloud function inventory client
//! - [`error`] - error types shared across the crate

pub mod error;
pub mod extension;
pub mod extension_data;
pub mod functions;
pub mod mesh;
pub mod proxy;
pub mod registrator;
pub mod service;
pub mod store;

pub use error::{Error, Result};
