//! Multi-listener TCP proxy
//!
//! The proxy [`Server`] owns one [`Listener`] per configured upstream. Each
//! listener accepts local TCP connections and pipes them to a destination
//! produced by its dial closure. Listener-level failures are fatal — the
//! proxy must not partially serve its declared upstreams — while
//! connection-scoped failures are logged and never tear the server down.

mod listener;

pub use listener::{ErrorChannel, Listener};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Proxy lifecycle and connection errors.
///
/// Carries rendered messages rather than source errors so values can sit in
/// the bounded connection-error buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Serve was called on a listener that has already been closed
    #[error("serve called on a closed listener")]
    ClosedListener,

    /// Serve was called on a server that has already been closed
    #[error("serve called on a closed server")]
    ClosedServer,

    /// The listen closure failed
    #[error("failed to listen: {0}")]
    Listen(String),

    /// Accepting a connection failed while the listener was not stopping
    #[error("failed to accept: {0}")]
    Accept(String),

    /// The dial closure failed for one connection
    #[error("{0}")]
    Dial(String),

    /// An established connection failed while copying bytes
    #[error("{0}")]
    Connection(String),
}

/// A duplex byte stream; what a dial closure must produce.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

/// Boxed destination connection.
pub type BoxedConn = Box<dyn Duplex>;

/// Opens the local listener for one upstream.
pub type ListenFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<tokio::net::TcpListener>> + Send + Sync>;

/// Dials the destination for one connection.
pub type DialFn =
    Arc<dyn Fn() -> BoxFuture<'static, crate::error::Result<BoxedConn>> + Send + Sync>;

/// Configuration for a single proxied upstream.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Returns a TCP listener for incoming source connections
    pub listen: ListenFn,
    /// Dials the destination and returns the connection to pipe into
    pub dial: DialFn,
}

/// Proxy server managing the full set of upstream listeners.
pub struct Server {
    cfgs: Vec<ProxyConfig>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    ready: watch::Sender<bool>,
    stop: AtomicBool,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new, unstarted proxy server from the given configurations.
    pub fn new(cfgs: Vec<ProxyConfig>) -> Self {
        Self {
            cfgs,
            listeners: Mutex::new(Vec::new()),
            ready: watch::Sender::new(false),
            stop: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start every configured listener and block until the server is closed
    /// or a listener fails.
    ///
    /// Connection errors are logged and non-fatal. A failed listener is not
    /// recovered; its error is returned and the whole proxy must be torn
    /// down by the caller.
    pub async fn serve(&self) -> Result<(), ProxyError> {
        if self.stop.load(Ordering::Acquire) {
            return Err(ProxyError::ClosedServer);
        }

        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ProxyError>(self.cfgs.len().max(1));

        let mut listeners = Vec::with_capacity(self.cfgs.len());
        for cfg in &self.cfgs {
            let listener = Arc::new(Listener::new(cfg.clone()));
            listeners.push(listener.clone());

            let serving = listener.clone();
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = serving.serve().await {
                    let _ = fatal.send(err).await;
                }
            });

            let errors = listener.errors();
            tokio::spawn(async move {
                while let Some(err) = errors.recv().await {
                    warn!(error = %err, "proxy connection error");
                }
            });
        }
        drop(fatal_tx);

        *self.listeners.lock() = listeners.clone();

        // Flip the readiness flag once every listener is accepting.
        let ready = self.ready.clone();
        tokio::spawn(async move {
            for listener in &listeners {
                listener.wait_listening().await;
            }
            ready.send_replace(true);
        });

        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(()),
            fatal = fatal_rx.recv() => match fatal {
                Some(err) => Err(err),
                // Every listener exited cleanly (or none were configured);
                // keep serving until closed.
                None => {
                    self.shutdown.cancelled().await;
                    Ok(())
                }
            },
        }
    }

    /// Resolve once every configured listener is accepting connections.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Shut down every listener in parallel and release `serve`.
    ///
    /// Idempotent; returns once all listeners have stopped and their
    /// connection handlers have been joined.
    pub async fn close(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        let listeners = self.listeners.lock().clone();
        join_all(listeners.iter().map(|listener| listener.close())).await;

        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

    fn take_listener(listener: TokioTcpListener) -> ListenFn {
        let slot = Arc::new(Mutex::new(Some(listener)));
        Arc::new(move || {
            let slot = slot.clone();
            async move {
                slot.lock().take().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "listener already taken")
                })
            }
            .boxed()
        })
    }

    fn dial_tcp(addr: SocketAddr) -> DialFn {
        Arc::new(move || {
            async move {
                let conn = TcpStream::connect(addr)
                    .await
                    .map_err(crate::error::Error::from)?;
                Ok(Box::new(conn) as BoxedConn)
            }
            .boxed()
        })
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = sock.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn upstream_config(echo: SocketAddr) -> (ProxyConfig, SocketAddr) {
        let tcp = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        (
            ProxyConfig {
                listen: take_listener(tcp),
                dial: dial_tcp(echo),
            },
            addr,
        )
    }

    #[tokio::test]
    async fn ready_after_every_listener_is_accepting() {
        let echo = spawn_echo().await;
        let (cfg_a, addr_a) = upstream_config(echo).await;
        let (cfg_b, addr_b) = upstream_config(echo).await;

        let server = Arc::new(Server::new(vec![cfg_a, cfg_b]));
        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve().await });

        tokio::time::timeout(Duration::from_secs(5), server.ready())
            .await
            .expect("server becomes ready");

        // Both upstream listeners are live.
        for addr in [addr_a, addr_b] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }

        server.close().await;
        assert!(handle.await.unwrap().is_ok());
    }

    /// A function with no upstreams still runs an (empty) proxy until
    /// closed.
    #[tokio::test]
    async fn serves_with_no_upstreams_until_closed() {
        let server = Arc::new(Server::new(Vec::new()));
        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve().await });

        tokio::time::timeout(Duration::from_secs(5), server.ready())
            .await
            .expect("empty server is trivially ready");
        assert!(!handle.is_finished());

        server.close().await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn listener_failure_is_fatal_to_serve() {
        let failing = ProxyConfig {
            listen: Arc::new(|| {
                async {
                    Err::<TokioTcpListener, _>(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        "address in use",
                    ))
                }
                .boxed()
            }),
            dial: dial_tcp("127.0.0.1:1".parse().unwrap()),
        };

        let server = Server::new(vec![failing]);
        let err = server.serve().await.unwrap_err();
        assert!(matches!(err, ProxyError::Listen(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_serve_after_close_fails() {
        let echo = spawn_echo().await;
        let (cfg, _) = upstream_config(echo).await;
        let server = Arc::new(Server::new(vec![cfg]));

        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve().await });
        server.ready().await;

        server.close().await;
        server.close().await;
        assert!(handle.await.unwrap().is_ok());

        let err = server.serve().await.unwrap_err();
        assert_eq!(err, ProxyError::ClosedServer);
    }

    #[tokio::test]
    async fn connection_error_does_not_stop_the_server() {
        // Dial target that refuses connections: reserve a port, then drop it.
        let doomed_addr = {
            let tmp = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap()
        };

        let tcp = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let server = Arc::new(Server::new(vec![ProxyConfig {
            listen: take_listener(tcp),
            dial: dial_tcp(doomed_addr),
        }]));

        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve().await });
        server.ready().await;

        // The connection is dropped but serve keeps running.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let _ = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("doomed connection terminates");
        assert!(!handle.is_finished());

        server.close().await;
        assert!(handle.await.unwrap().is_ok());
    }
}
