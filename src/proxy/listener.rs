//! Single-upstream proxy listener
//!
//! A [`Listener`] owns one TCP accept loop and every connection opened
//! through it. Listen and dial behavior are pluggable closures so the same
//! lifecycle serves plain TCP in tests and mTLS toward the mesh gateway in
//! production.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::{BoxedConn, DialFn, ListenFn, ProxyConfig, ProxyError};

/// Connection-scoped error buffer size.
pub(crate) const ERROR_BUFFER: usize = 5;

/// Bounded error buffer with drop-oldest overflow.
///
/// Producers never block: when the buffer is full the oldest entry is
/// drained before the new one is pushed. After [`ErrorChannel::close`] no
/// further pushes are accepted and `recv` drains whatever remains before
/// returning `None`.
#[derive(Clone)]
pub struct ErrorChannel {
    shared: Arc<ErrorShared>,
}

struct ErrorShared {
    queue: Mutex<VecDeque<ProxyError>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl ErrorChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(ErrorShared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                capacity,
            }),
        }
    }

    /// Push an error, dropping the oldest buffered entry on overflow.
    /// A no-op once the channel is closed.
    pub(crate) fn push(&self, err: ProxyError) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            while queue.len() >= self.shared.capacity {
                queue.pop_front();
            }
            queue.push_back(err);
        }
        self.shared.notify.notify_one();
    }

    /// Receive the next error; `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<ProxyError> {
        loop {
            if let Some(err) = self.shared.queue.lock().pop_front() {
                return Some(err);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    pub(crate) fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.notify.notify_waiters();
            self.shared.notify.notify_one();
        }
    }
}

/// One proxy listener: an accept loop plus the set of connection handlers it
/// has spawned.
///
/// Lifecycle: `New -> Listening -> Stopped`. [`Listener::serve`] drives the
/// accept loop until [`Listener::close`] is called or accepting fails;
/// `close` joins every in-flight connection handler before returning.
pub struct Listener {
    listen: ListenFn,
    dial: DialFn,
    errors: ErrorChannel,
    stop: AtomicBool,
    shutdown: CancellationToken,
    listening: watch::Sender<bool>,
    conns: TaskTracker,
}

impl Listener {
    /// Create an unstarted listener from the given config.
    pub fn new(cfg: ProxyConfig) -> Self {
        Self {
            listen: cfg.listen,
            dial: cfg.dial,
            errors: ErrorChannel::new(ERROR_BUFFER),
            stop: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            listening: watch::Sender::new(false),
            conns: TaskTracker::new(),
        }
    }

    /// Run the listener until it is stopped.
    ///
    /// Calling `serve` on a listener that has already been closed fails with
    /// [`ProxyError::ClosedListener`]. An accept error observed while the
    /// stop flag is set is a clean shutdown.
    pub async fn serve(&self) -> Result<(), ProxyError> {
        if self.stop.load(Ordering::Acquire) {
            return Err(ProxyError::ClosedListener);
        }

        let listener = match (self.listen)().await {
            Ok(listener) => listener,
            Err(err) => {
                self.close().await;
                return Err(ProxyError::Listen(err.to_string()));
            }
        };

        self.listening.send_replace(true);

        let result = self.accept_loop(listener).await;
        self.close().await;
        result
    }

    async fn accept_loop(&self, listener: tokio::net::TcpListener) -> Result<(), ProxyError> {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((src, peer)) => {
                        if self.stop.load(Ordering::Acquire) {
                            return Ok(());
                        }
                        debug!(peer = %peer, "accepted connection");
                        self.conns.spawn(handle_conn(
                            src,
                            self.dial.clone(),
                            self.errors.clone(),
                            self.shutdown.clone(),
                        ));
                    }
                    Err(err) => {
                        if self.stop.load(Ordering::Acquire) {
                            return Ok(());
                        }
                        return Err(ProxyError::Accept(err.to_string()));
                    }
                },
            }
        }
    }

    /// Resolve once the listener is accepting connections.
    ///
    /// Never resolves if `listen()` fails; pair with a timeout or race
    /// against the serve result.
    pub async fn wait_listening(&self) {
        let mut rx = self.listening.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Connection-scoped errors reported by handler tasks.
    pub fn errors(&self) -> ErrorChannel {
        self.errors.clone()
    }

    /// Stop the listener and wait for every connection handler to finish.
    ///
    /// Idempotent and safe to call concurrently; only the first caller
    /// performs the shutdown.
    pub async fn close(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        self.errors.close();
        self.conns.close();
        self.conns.wait().await;
    }
}

/// Per-connection handler: dial the destination and shuttle bytes both ways
/// until either side closes or the listener shuts down.
async fn handle_conn(
    mut src: TcpStream,
    dial: DialFn,
    errors: ErrorChannel,
    shutdown: CancellationToken,
) {
    // The dial races the stop signal too, so a hung handshake can never
    // block shutdown.
    let mut dst: BoxedConn = tokio::select! {
        dialed = dial() => match dialed {
            Ok(conn) => conn,
            Err(err) => {
                errors.push(ProxyError::Dial(format!(
                    "failed to dial destination: {err}"
                )));
                return;
            }
        },
        _ = shutdown.cancelled() => return,
    };

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut src, &mut dst) => {
            if let Err(err) = copied {
                errors.push(ProxyError::Connection(format!("connection failed: {err}")));
            }
        }
        _ = shutdown.cancelled() => {}
    }
    // Both sockets drop here, closing the pair.
}
