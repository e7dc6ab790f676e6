//! Listener-owning server task.
//!
//! # Responsibilities
//! - Bind the HTTP (and optional HTTPS) listeners for the active routing generation
//! - On every new generation: stop the current listeners, wait for in-flight requests
//!   to finish, then bind again with the new router
//! - Publish the bound addresses for callers waiting on a generation
//!
//! # Design Decisions
//! - At most one generation of listeners is bound at a time
//! - Port 0 is resolved on the first bind and reused afterwards
//! - Bind failures are retried with backoff; a generation that cannot bind is logged
//!   and the next update retries
//! - Draining is bounded by `drain_timeout`; stragglers are aborted

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Extension;
use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;

use crate::config::{GatewayConfig, HttpsConfig};
use crate::gateway::Generation;
use crate::http::request::TlsConnection;
use crate::lifecycle::ShutdownListener;
use crate::resilience::RetryPolicy;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS certificate: {0}")]
    Tls(#[source] io::Error),

    #[error("server stopped before generation {0} was bound")]
    Stopped(u64),
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http: SocketAddr,
    pub https: Option<TlsSettings>,
    pub bind_retry: RetryPolicy,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub addr: SocketAddr,
    pub cert_path: String,
    pub key_path: String,
}

impl ServerConfig {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ServerError> {
        Ok(Self {
            http: parse_addr(&config.listen_address)?,
            https: config.https.as_ref().map(TlsSettings::from_config).transpose()?,
            bind_retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(30),
        })
    }
}

impl TlsSettings {
    fn from_config(config: &HttpsConfig) -> Result<Self, ServerError> {
        Ok(Self {
            addr: parse_addr(&config.listen_address)?,
            cert_path: config.cert_path.clone(),
            key_path: config.key_path.clone(),
        })
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    addr.parse().map_err(|source| ServerError::InvalidAddress {
        addr: addr.to_string(),
        source,
    })
}

/// Addresses the listeners of one generation are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bound {
    pub generation: u64,
    pub http: Option<SocketAddr>,
    pub https: Option<SocketAddr>,
}

/// Cloneable view of the server's bind state.
#[derive(Clone)]
pub struct ServerHandle {
    bound: watch::Receiver<Bound>,
}

impl ServerHandle {
    /// Wait until generation `generation` (or a newer one) is bound.
    pub async fn wait_serving(&self, generation: u64) -> Result<Bound, ServerError> {
        let mut bound = self.bound.clone();
        let current = bound
            .wait_for(|b| b.generation >= generation)
            .await
            .map_err(|_| ServerError::Stopped(generation))?;
        Ok(*current)
    }

    pub fn bound(&self) -> Bound {
        *self.bound.borrow()
    }
}

pub struct Server {
    config: ServerConfig,
    updates: watch::Receiver<Option<Arc<Generation>>>,
    shutdown: ShutdownListener,
    bound: watch::Sender<Bound>,
    resolved_http: Option<SocketAddr>,
    resolved_https: Option<SocketAddr>,
    tls: Option<RustlsConfig>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        updates: watch::Receiver<Option<Arc<Generation>>>,
        shutdown: ShutdownListener,
    ) -> Self {
        let (bound, _) = watch::channel(Bound::default());
        Self {
            config,
            updates,
            shutdown,
            bound,
            resolved_http: None,
            resolved_https: None,
            tls: None,
        }
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            bound: self.bound.subscribe(),
        }
    }

    /// Serve generations as they arrive until shutdown or until the gateway goes away.
    pub async fn run(mut self) {
        let mut active: Option<ActiveListeners> = None;
        // A generation activated before we subscribed still has to be bound.
        self.updates.mark_changed();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                changed = self.updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(previous) = active.take() {
                        previous.drain(self.config.drain_timeout).await;
                    }
                    // Anything that arrived during the drain supersedes what woke us up.
                    let newest = self.updates.borrow_and_update().clone();
                    let Some(generation) = newest else { continue };

                    match self.bind(&generation).await {
                        Ok(listeners) => {
                            self.bound.send_replace(Bound {
                                generation: generation.id,
                                http: Some(listeners.http_addr),
                                https: listeners.https_addr,
                            });
                            active = Some(listeners);
                        }
                        Err(e) => {
                            tracing::error!(generation = generation.id, error = %e, "Failed to bind listeners");
                        }
                    }
                }
            }
        }

        if let Some(listeners) = active.take() {
            listeners.drain(self.config.drain_timeout).await;
        }
        tracing::info!("Server stopped");
    }

    async fn bind(&mut self, generation: &Generation) -> Result<ActiveListeners, ServerError> {
        let app = axum::Router::new()
            .fallback_service(generation.router.clone())
            .layer(CatchPanicLayer::new());

        let http_addr = self.resolved_http.unwrap_or(self.config.http);
        let listener = bind_with_retry(http_addr, self.config.bind_retry).await?;
        let http_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: http_addr,
            source,
        })?;
        self.resolved_http = Some(http_addr);

        let (stop, stopped) = oneshot::channel::<()>();
        let service = app.clone().into_make_service_with_connect_info::<SocketAddr>();
        let http_task = tokio::spawn(async move {
            axum::serve(listener, service)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
        });

        let https = match self.config.https.clone() {
            Some(settings) => match self.bind_tls(&settings, app).await {
                Ok(https) => Some(https),
                Err(e) => {
                    let _ = stop.send(());
                    let _ = http_task.await;
                    return Err(e);
                }
            },
            None => None,
        };

        tracing::info!(
            generation = generation.id,
            http = %http_addr,
            https = ?https.as_ref().map(|l| l.addr),
            domains = ?generation.domains,
            "Listeners bound"
        );

        Ok(ActiveListeners {
            generation: generation.id,
            http_addr,
            https_addr: https.as_ref().map(|l| l.addr),
            http: PlainListener {
                stop,
                task: http_task,
            },
            https,
        })
    }

    async fn bind_tls(
        &mut self,
        settings: &TlsSettings,
        app: axum::Router,
    ) -> Result<TlsListener, ServerError> {
        let tls = match &self.tls {
            Some(tls) => tls.clone(),
            None => {
                let tls = RustlsConfig::from_pem_file(&settings.cert_path, &settings.key_path)
                    .await
                    .map_err(ServerError::Tls)?;
                self.tls = Some(tls.clone());
                tls
            }
        };

        let addr = self.resolved_https.unwrap_or(settings.addr);
        let app = app.layer(Extension(TlsConnection));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let handle = axum_server::Handle::new();
            let service = app.clone().into_make_service_with_connect_info::<SocketAddr>();
            let server = axum_server::bind_rustls(addr, tls.clone()).handle(handle.clone());
            let task = tokio::spawn(async move { server.serve(service).await });

            if let Some(bound) = handle.listening().await {
                self.resolved_https = Some(bound);
                return Ok(TlsListener {
                    addr: bound,
                    handle,
                    task,
                });
            }

            let source = match task.await {
                Ok(Err(e)) => e,
                Ok(Ok(())) => io::Error::new(io::ErrorKind::Other, "listener exited before binding"),
                Err(e) => io::Error::new(io::ErrorKind::Other, e),
            };
            match self.config.bind_retry.delay(attempt) {
                Some(delay) => {
                    tracing::warn!(address = %addr, attempt, error = %source, "HTTPS bind failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(ServerError::Bind { addr, source }),
            }
        }
    }
}

async fn bind_with_retry(addr: SocketAddr, policy: RetryPolicy) -> Result<TcpListener, ServerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(source) => match policy.delay(attempt) {
                Some(delay) => {
                    tracing::warn!(address = %addr, attempt, error = %source, "Bind failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(ServerError::Bind { addr, source }),
            },
        }
    }
}

struct PlainListener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

struct TlsListener {
    addr: SocketAddr,
    handle: axum_server::Handle,
    task: JoinHandle<io::Result<()>>,
}

struct ActiveListeners {
    generation: u64,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    http: PlainListener,
    https: Option<TlsListener>,
}

impl ActiveListeners {
    /// Stop accepting, then wait for in-flight requests up to `timeout`.
    async fn drain(self, timeout: Duration) {
        tracing::info!(generation = self.generation, "Draining listeners");
        let _ = self.http.stop.send(());
        let mut tasks = vec![self.http.task];
        if let Some(https) = self.https {
            https.handle.graceful_shutdown(Some(timeout));
            tasks.push(https.task);
        }

        for mut task in tasks {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::error!(error = %e, "Listener failed"),
                Ok(Err(e)) => tracing::error!(error = %e, "Listener task panicked"),
                Err(_) => {
                    tracing::warn!(generation = self.generation, "Drain timed out, aborting remaining requests");
                    task.abort();
                }
            }
        }
        tracing::info!(generation = self.generation, "Listeners drained");
    }
}
