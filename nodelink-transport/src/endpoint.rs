//! Listening endpoint for inbound peer connections.

use std::io;
use std::time::Duration;

use nodelink_core::{NetworkProvider, TaskProvider, TcpListenerTrait, TimeProvider};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::TransportError;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the accept loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listener that has not started accepting yet.
pub struct BoundListener<L> {
    listener: L,
    local_addr: String,
    local_port: u16,
}

impl<L> BoundListener<L>
where
    L: TcpListenerTrait + Send + Sync + 'static,
{
    /// Port the listener is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Start the accept loop, handing every accepted stream to `on_accept`.
    pub fn serve<TP, T, F>(self, task: &TP, time: &T, on_accept: F) -> ListeningEndpoint
    where
        TP: TaskProvider,
        T: TimeProvider,
        F: Fn(L::TcpStream, String) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let listener = self.listener;
        let time = time.clone();
        let local_addr = self.local_addr.clone();

        let accept_loop = task.spawn_task("accept-loop", async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!(addr = %peer_addr, "accepted inbound connection");
                            on_accept(stream, peer_addr);
                        }
                        Err(err) => {
                            tracing::warn!(addr = %local_addr, error = %err, "accept failed");
                            tokio::select! {
                                _ = loop_cancel.cancelled() => break,
                                _ = time.sleep(ACCEPT_ERROR_BACKOFF) => {}
                            }
                        }
                    }
                }
            }
            tracing::debug!(addr = %local_addr, "accept loop stopped");
        });

        ListeningEndpoint {
            local_addr: self.local_addr,
            local_port: self.local_port,
            cancel,
            accept_loop: Mutex::new(Some(accept_loop)),
        }
    }
}

/// Server socket accepting inbound peer connections.
#[derive(Debug)]
pub struct ListeningEndpoint {
    local_addr: String,
    local_port: u16,
    cancel: CancellationToken,
    accept_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ListeningEndpoint {
    /// Bind the configured `host:port`, bounded by `bind_timeout`.
    ///
    /// With auto-increment enabled, an `AddrInUse` failure moves on to the
    /// next port, up to `port + port_count`. Any other error, a timeout, or
    /// running out of ports is fatal.
    pub async fn bind<N, T>(
        config: &TransportConfig,
        network: &N,
        time: &T,
    ) -> Result<BoundListener<N::TcpListener>, TransportError>
    where
        N: NetworkProvider,
        T: TimeProvider,
    {
        let first = config.port;
        let last = if config.port_auto_increment {
            first.saturating_add(config.port_count)
        } else {
            first
        };

        for port in first..=last {
            let addr = format!("{}:{}", config.host, port);
            let bound = time
                .timeout(config.bind_timeout, network.bind(&addr))
                .await
                .map_err(|_| TransportError::BindTimeout { addr: addr.clone() })?;

            match bound {
                Ok(listener) => {
                    let local_port = listener
                        .local_port()
                        .map_err(|source| TransportError::Bind {
                            addr: addr.clone(),
                            source,
                        })?;
                    let local_addr = listener.local_addr().unwrap_or_else(|_| addr.clone());
                    tracing::info!(addr = %local_addr, "listening for peer connections");
                    return Ok(BoundListener {
                        listener,
                        local_addr,
                        local_port,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse && config.port_auto_increment => {
                    tracing::warn!(addr = %addr, "port in use, trying the next one");
                }
                Err(source) => return Err(TransportError::Bind { addr, source }),
            }
        }

        Err(TransportError::PortRangeExhausted {
            host: config.host.clone(),
            first,
            last,
        })
    }

    /// Port the endpoint is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Whether the accept loop has been told to stop.
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting and release the socket, waiting up to `grace`.
    pub async fn dispose<T: TimeProvider>(&self, time: &T, grace: Duration) {
        self.cancel.cancel();
        let accept_loop = self.accept_loop.lock().take();
        if let Some(mut handle) = accept_loop {
            if time.timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(addr = %self.local_addr, "accept loop did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}
