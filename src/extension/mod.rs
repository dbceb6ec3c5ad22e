//! Extension runtime
//!
//! The sidecar half of lambda-mesh. It owns the proxy server's lifetime and
//! the mTLS credentials the proxy dials with, and drives the runtime event
//! loop. Three tasks run concurrently once started:
//!
//! - the proxy server (one local TCP listener per upstream),
//! - a periodic credential refresh from the parameter store,
//! - the runtime event pump.
//!
//! They communicate only through one error channel; the first task to finish
//! supplies the extension's exit status.

pub mod runtime_api;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::extension_data::ExtensionData;
use crate::proxy::{BoxedConn, DialFn, ListenFn, ProxyConfig, Server};
use crate::service::{EnterpriseMeta, Service};
use crate::store::ParamStore;
use runtime_api::EventProcessor;
use tls::TlsMaterial;

/// Extension configuration, loaded from the environment by the CLI.
#[derive(Clone, Debug)]
pub struct ExtensionConfig {
    /// Name of the local function's mesh service
    pub service_name: String,
    /// Namespace of the local service (enterprise only)
    pub service_namespace: String,
    /// Partition of the local service (enterprise only)
    pub service_partition: String,
    /// Upstream descriptors, one local listener each
    pub upstreams: Vec<String>,
    /// `host:port` of the mesh gateway every upstream dial goes through
    pub mesh_gateway_uri: String,
    /// Parameter-store prefix holding this service's mTLS material
    pub extension_data_prefix: String,
    /// How often to re-fetch the mTLS material
    pub refresh_frequency: Duration,
    /// How long to wait for all proxy listeners to come up
    pub proxy_timeout: Duration,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_namespace: String::new(),
            service_partition: String::new(),
            upstreams: Vec::new(),
            mesh_gateway_uri: String::new(),
            extension_data_prefix: String::new(),
            refresh_frequency: Duration::from_secs(5 * 60),
            proxy_timeout: Duration::from_secs(3),
        }
    }
}

/// Everything the dial path reads, behind one RW lock.
///
/// The refresh task is the only writer. Dials take the read side for the
/// whole handshake, so a rotation swaps credentials atomically between
/// connections and never inside one.
struct SharedState {
    data: ExtensionData,
    material: Option<TlsMaterial>,
    upstreams: Vec<Service>,
    /// Bumped on every install; observable by tests
    generation: u64,
}

impl SharedState {
    fn install(&mut self, data: ExtensionData, material: TlsMaterial) {
        for upstream in &mut self.upstreams {
            upstream.trust_domain = data.trust_domain.clone();
        }
        self.data = data;
        self.material = Some(material);
        self.generation += 1;
        info!(generation = self.generation, "installed extension data");
    }
}

/// The extension process: proxy + credential refresh + event pump.
pub struct Extension {
    config: ExtensionConfig,
    service: Service,
    store: Arc<dyn ParamStore>,
    events: Arc<dyn EventProcessor>,
    state: Arc<RwLock<SharedState>>,
}

impl Extension {
    /// Create an extension from its configuration and collaborators.
    pub fn new(
        config: ExtensionConfig,
        store: Arc<dyn ParamStore>,
        events: Arc<dyn EventProcessor>,
    ) -> Self {
        let service = Service {
            name: config.service_name.clone(),
            enterprise_meta: EnterpriseMeta::new(
                &config.service_partition,
                &config.service_namespace,
            ),
            ..Service::default()
        };
        Self {
            config,
            service,
            store,
            events,
            state: Arc::new(RwLock::new(SharedState {
                data: ExtensionData::default(),
                material: None,
                upstreams: Vec::new(),
                generation: 0,
            })),
        }
    }

    /// Run the extension until shutdown or a fatal error.
    ///
    /// Start order: parse upstreams, fetch the initial credentials while
    /// holding the write lock, start the proxy and wait for readiness, then
    /// spawn the refresh task and the event pump.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let tasks = shutdown.child_token();
        let result = self.run(&tasks).await;
        tasks.cancel();
        result
    }

    async fn run(self, shutdown: &CancellationToken) -> Result<()> {
        let key = format!(
            "{}{}",
            self.config.extension_data_prefix,
            self.service.extension_path()
        );

        let upstreams = self
            .config
            .upstreams
            .iter()
            .map(|s| Service::parse_upstream(s))
            .collect::<Result<Vec<_>>>()?;

        // Initial fetch: the write guard is held across the round trip so no
        // dial can observe empty credentials.
        {
            let mut guard = self.state.write().await;
            guard.upstreams = upstreams;
            let data = fetch_data(self.store.as_ref(), &key).await?;
            let material = TlsMaterial::from_data(&data)?;
            guard.install(data, material);
        }

        let configs = {
            let guard = self.state.read().await;
            guard
                .upstreams
                .iter()
                .enumerate()
                .map(|(idx, upstream)| {
                    debug!(name = %upstream.name, port = upstream.port, "configuring upstream");
                    self.proxy_config(idx, upstream.port)
                })
                .collect::<Vec<_>>()
        };

        let proxy = Arc::new(Server::new(configs));
        let (err_tx, mut err_rx) = mpsc::channel::<Result<()>>(3);

        let serve_proxy = proxy.clone();
        let serve_tx = err_tx.clone();
        tokio::spawn(async move {
            let result = serve_proxy.serve().await.map_err(Error::from);
            let _ = serve_tx.send(result).await;
        });

        // Readiness is the gate for everything that follows; a proxy that
        // cannot bind its listeners within the bound is fatal.
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("cancelled while waiting for proxy to start");
                proxy.close().await;
                return Ok(());
            }
            _ = proxy.ready() => {
                info!("proxy server ready");
            }
            failed = err_rx.recv() => {
                proxy.close().await;
                return match failed {
                    Some(Err(err)) => Err(err),
                    _ => Err(Error::ProxyStartTimeout),
                };
            }
            _ = tokio::time::sleep(self.config.proxy_timeout) => {
                proxy.close().await;
                return Err(Error::ProxyStartTimeout);
            }
        }

        let refresh_tx = err_tx.clone();
        let refresh_store = self.store.clone();
        let refresh_state = self.state.clone();
        let refresh_shutdown = shutdown.clone();
        let frequency = self.config.refresh_frequency;
        let refresh_key = key.clone();
        tokio::spawn(async move {
            let result = refresh_loop(
                refresh_store,
                refresh_state,
                refresh_key,
                frequency,
                refresh_shutdown,
            )
            .await;
            let _ = refresh_tx.send(result).await;
        });

        // The first poll signals init-complete to the runtime, which is why
        // the pump starts only now that the proxy is accepting.
        let pump_tx = err_tx.clone();
        let pump_events = self.events.clone();
        let pump_shutdown = shutdown.clone();
        tokio::spawn(async move {
            info!("processing events");
            let result = pump_events.process_events(pump_shutdown).await;
            let _ = pump_tx.send(result).await;
        });
        drop(err_tx);

        let result = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            received = err_rx.recv() => received.unwrap_or(Ok(())),
        };

        proxy.close().await;
        result
    }

    /// Listener and dial behavior for one upstream.
    ///
    /// The dial closure holds the credentials read lock for the whole
    /// handshake, so in-flight dials see a consistent snapshot while new
    /// dials after a rotation pick up the replacement.
    fn proxy_config(&self, idx: usize, port: u16) -> ProxyConfig {
        let listen: ListenFn = Arc::new(move || {
            async move { tokio::net::TcpListener::bind(("0.0.0.0", port)).await }.boxed()
        });

        let state = self.state.clone();
        let gateway = self.config.mesh_gateway_uri.clone();
        let dial: DialFn = Arc::new(move || {
            let state = state.clone();
            let gateway = gateway.clone();
            async move {
                let guard = state.read().await;
                let upstream = guard
                    .upstreams
                    .get(idx)
                    .ok_or_else(|| Error::config(format!("unknown upstream index {idx}")))?;
                let material = guard
                    .material
                    .as_ref()
                    .ok_or_else(|| Error::tls_material("extension data not initialized"))?;

                let config = material.client_config(&upstream.spiffe_id())?;
                let conn = tls::dial_gateway(&gateway, &upstream.sni(), config).await?;
                Ok(Box::new(conn) as BoxedConn)
            }
            .boxed()
        });

        ProxyConfig { listen, dial }
    }
}

/// Fetch and decode one extension-data snapshot.
async fn fetch_data(store: &dyn ParamStore, key: &str) -> Result<ExtensionData> {
    info!(key = %key, "retrieving extension data");
    let raw = store
        .get(key)
        .await
        .map_err(|err| Error::store(format!("failed to get extension data for {key}: {err}")))?;
    serde_json::from_str(&raw).map_err(|err| {
        Error::store(format!(
            "failed to unmarshal extension data for {key}: {err}"
        ))
    })
}

/// Periodic credential refresh.
///
/// A failed fetch is fatal: losing the stored record usually means the
/// function was removed from the mesh, and a proxy running on stale
/// credentials must not keep reaching mesh peers.
async fn refresh_loop(
    store: Arc<dyn ParamStore>,
    state: Arc<RwLock<SharedState>>,
    key: String,
    frequency: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval fires immediately; the initial fetch already happened
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let data = fetch_data(store.as_ref(), &key).await?;
                refresh(&state, data).await?;
            }
        }
    }
}

/// Apply one fetched snapshot: no-op when unchanged, otherwise swap the
/// cached data and parsed material under the write lock.
async fn refresh(state: &RwLock<SharedState>, data: ExtensionData) -> Result<()> {
    {
        let guard = state.read().await;
        if guard.data == data {
            debug!("extension data unchanged");
            return Ok(());
        }
    }

    // Parse outside the critical section; only the install itself blocks
    // dials.
    let material = TlsMaterial::from_data(&data)?;
    let mut guard = state.write().await;
    guard.install(data, material);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::extension::runtime_api::MockEventProcessor;
    use crate::extension::tls::testing::TestCa;
    use crate::store::MockParamStore;

    fn valid_data(ca: &TestCa, trust_domain: &str) -> ExtensionData {
        let (cert, key) = ca.issue_leaf(&format!(
            "spiffe://{trust_domain}/ns/default/dc/dc1/svc/lambda-1234"
        ));
        ExtensionData {
            private_key_pem: key,
            cert_pem: cert,
            root_cert_pem: ca.cert_pem.clone(),
            trust_domain: trust_domain.to_string(),
            peers: None,
        }
    }

    fn config(upstreams: Vec<&str>) -> ExtensionConfig {
        ExtensionConfig {
            service_name: "lambda-1234".to_string(),
            mesh_gateway_uri: "127.0.0.1:1".to_string(),
            extension_data_prefix: "/lambda-mesh/data".to_string(),
            upstreams: upstreams.into_iter().map(str::to_string).collect(),
            refresh_frequency: Duration::from_secs(300),
            ..ExtensionConfig::default()
        }
    }

    fn store_returning(payloads: Vec<crate::error::Result<String>>) -> MockParamStore {
        let mut store = MockParamStore::new();
        let mut payloads = payloads.into_iter();
        store.expect_get().returning(move |_| {
            payloads
                .next()
                .unwrap_or_else(|| Err(Error::store("no more scripted responses")))
        });
        store
    }

    fn idle_pump() -> MockEventProcessor {
        let mut events = MockEventProcessor::new();
        events.expect_process_events().returning(|shutdown| {
            Box::pin(async move {
                shutdown.cancelled().await;
                Ok(())
            })
        });
        events
    }

    #[tokio::test]
    async fn invalid_upstream_is_fatal() {
        let extension = Extension::new(
            config(vec!["svc:notaport"]),
            Arc::new(MockParamStore::new()),
            Arc::new(MockEventProcessor::new()),
        );
        let err = extension.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUpstream(_)));
    }

    #[tokio::test]
    async fn initial_fetch_failure_is_fatal() {
        let store = store_returning(vec![Err(Error::store("access denied"))]);
        let extension = Extension::new(
            config(vec!["svc:0"]),
            Arc::new(store),
            Arc::new(MockEventProcessor::new()),
        );
        let err = extension.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn undecodable_extension_data_is_fatal() {
        let store = store_returning(vec![Ok("not json".to_string())]);
        let extension = Extension::new(
            config(vec!["svc:0"]),
            Arc::new(store),
            Arc::new(MockEventProcessor::new()),
        );
        let err = extension.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn pump_completion_supplies_the_exit_status() {
        let ca = TestCa::new();
        let data = serde_json::to_string(&valid_data(&ca, "td.consul")).unwrap();
        let store = store_returning(vec![Ok(data)]);

        let mut events = MockEventProcessor::new();
        events
            .expect_process_events()
            .returning(|_| Box::pin(async { Ok(()) }));

        let extension = Extension::new(config(vec!["svc:0"]), Arc::new(store), Arc::new(events));

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            extension.start(CancellationToken::new()),
        )
        .await
        .expect("extension exits once the pump returns");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn listener_bind_failure_is_fatal() {
        // Occupy a port, then configure the upstream on the same port.
        let blocker = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let ca = TestCa::new();
        let data = serde_json::to_string(&valid_data(&ca, "td.consul")).unwrap();
        let store = store_returning(vec![Ok(data)]);

        let upstream = format!("svc:{port}");
        let extension = Extension::new(
            config(vec![&upstream]),
            Arc::new(store),
            Arc::new(idle_pump()),
        );

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            extension.start(CancellationToken::new()),
        )
        .await
        .expect("bind failure surfaces promptly")
        .unwrap_err();
        assert!(matches!(err, Error::Proxy(_)));
    }

    #[tokio::test]
    async fn refresh_with_equal_data_does_not_reinstall() {
        let ca = TestCa::new();
        let data = valid_data(&ca, "td.consul");
        let material = TlsMaterial::from_data(&data).unwrap();

        let state = RwLock::new(SharedState {
            data: ExtensionData::default(),
            material: None,
            upstreams: vec![Service::parse_upstream("svc:1234").unwrap()],
            generation: 0,
        });
        state.write().await.install(data.clone(), material);
        assert_eq!(state.read().await.generation, 1);

        refresh(&state, data.clone()).await.unwrap();
        assert_eq!(state.read().await.generation, 1, "equal data must be a no-op");

        let mut rotated = data.clone();
        let other_ca = TestCa::new();
        let (cert, key) =
            other_ca.issue_leaf("spiffe://other.consul/ns/default/dc/dc1/svc/lambda-1234");
        rotated.cert_pem = cert;
        rotated.private_key_pem = key;
        rotated.root_cert_pem = other_ca.cert_pem.clone();
        rotated.trust_domain = "other.consul".to_string();

        refresh(&state, rotated).await.unwrap();
        let guard = state.read().await;
        assert_eq!(guard.generation, 2);
        assert_eq!(guard.upstreams[0].trust_domain, "other.consul");
    }

    #[tokio::test]
    async fn refresh_failure_ends_the_extension() {
        let ca = TestCa::new();
        let data = serde_json::to_string(&valid_data(&ca, "td.consul")).unwrap();
        // Initial fetch succeeds, the first refresh tick fails.
        let store = store_returning(vec![Ok(data), Err(Error::store("record deleted"))]);

        let mut cfg = config(vec!["svc:0"]);
        cfg.refresh_frequency = Duration::from_millis(20);

        let extension = Extension::new(cfg, Arc::new(store), Arc::new(idle_pump()));
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            extension.start(CancellationToken::new()),
        )
        .await
        .expect("refresh failure ends the run")
        .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_extension_cleanly() {
        let ca = TestCa::new();
        let data = serde_json::to_string(&valid_data(&ca, "td.consul")).unwrap();
        let store = store_returning(vec![Ok(data)]);

        let extension = Extension::new(
            config(vec!["svc:0"]),
            Arc::new(store),
            Arc::new(idle_pump()),
        );

        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(10), extension.start(shutdown))
            .await
            .expect("cancellation ends the run");
        assert!(result.is_ok());
    }
}
