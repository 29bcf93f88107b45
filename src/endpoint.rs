//! A single mock gRPC listener.
//!
//! [`MockEndpoint`] binds one port, mounts a dispatcher for every method of
//! its descriptor set and answers calls from its own matcher. Its lifecycle
//! is `Created -> Starting -> Ready -> Stopped` and never goes back.

use crate::descriptor::{DescriptorResolver, DescriptorSet};
use crate::dispatcher::{build_router, CallSettings, CallStats};
use crate::error::EndpointError;
use crate::matcher::{Matcher, StubStore};
use crate::rule::Rule;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

const PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Starting,
    Ready,
    /// Terminal. `error` holds the start or server failure, if any.
    Stopped { error: Option<String> },
}

/// Per-endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Interface to bind
    pub host: String,
    /// Call logging switches
    pub calls: CallSettings,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            calls: CallSettings::default(),
        }
    }
}

struct RunHandle {
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
    probe: JoinHandle<()>,
}

/// One listener serving every method of a descriptor set.
pub struct MockEndpoint {
    label: String,
    port: AtomicU16,
    settings: EndpointSettings,
    descriptors: Arc<DescriptorSet>,
    matcher: Arc<dyn Matcher>,
    stats: Arc<CallStats>,
    state: Arc<watch::Sender<Lifecycle>>,
    run: Mutex<Option<RunHandle>>,
}

impl MockEndpoint {
    /// Create an endpoint backed by a fresh [`StubStore`].
    pub fn new(
        label: impl Into<String>,
        port: u16,
        descriptors: Arc<DescriptorSet>,
        settings: EndpointSettings,
    ) -> Self {
        Self::with_matcher(label, port, descriptors, Arc::new(StubStore::new()), settings)
    }

    /// Create an endpoint with a caller-supplied matcher.
    pub fn with_matcher(
        label: impl Into<String>,
        port: u16,
        descriptors: Arc<DescriptorSet>,
        matcher: Arc<dyn Matcher>,
        settings: EndpointSettings,
    ) -> Self {
        let (state, _) = watch::channel(Lifecycle::Created);
        Self {
            label: label.into(),
            port: AtomicU16::new(port),
            settings,
            descriptors,
            matcher,
            stats: Arc::new(CallStats::default()),
            state: Arc::new(state),
            run: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bound port once started, the configured port before.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.borrow().clone()
    }

    /// True only while the listener accepts calls.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), Lifecycle::Ready)
    }

    pub fn matcher(&self) -> &Arc<dyn Matcher> {
        &self.matcher
    }

    pub fn descriptors(&self) -> &Arc<DescriptorSet> {
        &self.descriptors
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Bind the port and spawn the server.
    ///
    /// No-op while starting or running. A stopped endpoint cannot be
    /// restarted; the original start failure (or `Stopped`) is returned.
    pub async fn start(&self) -> Result<(), EndpointError> {
        let mut run = self.run.lock().await;
        let port = self.port();

        let current = self.lifecycle();
        match current {
            Lifecycle::Created => {}
            Lifecycle::Starting | Lifecycle::Ready => return Ok(()),
            Lifecycle::Stopped { error: Some(reason) } => {
                return Err(EndpointError::StartFailed { port, reason })
            }
            Lifecycle::Stopped { error: None } => return Err(EndpointError::Stopped { port }),
        }

        let (listener, addr) = match self.bind(port).await {
            Ok(bound) => bound,
            Err(err) => return Err(self.fail_start(err)),
        };
        self.port.store(addr.port(), Ordering::Release);

        let router = build_router(
            Arc::clone(&self.descriptors),
            Arc::clone(&self.matcher),
            Arc::clone(&self.stats),
            self.settings.calls,
        );

        self.state.send_replace(Lifecycle::Starting);

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = Server::builder()
            .add_routes(Routes::from(router))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                let _ = shutdown_rx.await;
            });

        let state = Arc::clone(&self.state);
        let label = self.label.clone();
        let server = tokio::spawn(async move {
            let result = server.await;
            if let Err(err) = &result {
                error!(label = %label, port = addr.port(), error = %err, "Server failed");
                state.send_replace(Lifecycle::Stopped {
                    error: Some(err.to_string()),
                });
            }
            result
        });

        let probe = tokio::spawn(probe_until_ready(probe_addr(addr), Arc::clone(&self.state)));

        info!(
            label = %self.label,
            port = addr.port(),
            methods = self.descriptors.methods().len(),
            "Endpoint started"
        );

        *run = Some(RunHandle {
            shutdown,
            server,
            probe,
        });
        Ok(())
    }

    /// Bind the listener and read back the address it got.
    async fn bind(&self, port: u16) -> Result<(TcpListener, SocketAddr), EndpointError> {
        let listener = TcpListener::bind((self.settings.host.as_str(), port))
            .await
            .map_err(|source| EndpointError::Bind { port, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| EndpointError::Bind { port, source })?;
        Ok((listener, addr))
    }

    /// Record a start failure so later calls report it.
    fn fail_start(&self, err: EndpointError) -> EndpointError {
        error!(label = %self.label, port = self.port(), error = %err, "Failed to start endpoint");
        self.state.send_replace(Lifecycle::Stopped {
            error: Some(err.to_string()),
        });
        err
    }

    /// Wait until the listener accepts TCP connections.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), EndpointError> {
        let port = self.port();
        if self.lifecycle() == Lifecycle::Created {
            return Err(EndpointError::NotStarted { port });
        }

        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, Lifecycle::Ready | Lifecycle::Stopped { .. })),
        )
        .await;

        match settled {
            Err(_) => Err(EndpointError::ReadinessTimeout { port, timeout }),
            Ok(Err(_)) => Err(EndpointError::Stopped { port }),
            Ok(Ok(state)) => match &*state {
                Lifecycle::Ready => Ok(()),
                Lifecycle::Stopped { error: Some(reason) } => Err(EndpointError::StartFailed {
                    port,
                    reason: reason.clone(),
                }),
                _ => Err(EndpointError::Stopped { port }),
            },
        }
    }

    /// Signal shutdown and wait for the server task.
    ///
    /// Safe to call before `start` and more than once.
    pub async fn stop(&self) -> Result<(), EndpointError> {
        let mut run = self.run.lock().await;
        let port = self.port();

        let Some(handle) = run.take() else {
            return Ok(());
        };

        let _ = handle.shutdown.send(());
        handle.probe.abort();
        let joined = handle.server.await;

        self.state.send_if_modified(|s| {
            if matches!(s, Lifecycle::Stopped { .. }) {
                false
            } else {
                *s = Lifecycle::Stopped { error: None };
                true
            }
        });

        match joined {
            Ok(Ok(())) => {
                info!(label = %self.label, port = port, "Endpoint stopped");
                Ok(())
            }
            Ok(Err(err)) => Err(EndpointError::Task {
                port,
                reason: err.to_string(),
            }),
            Err(err) => Err(EndpointError::Task {
                port,
                reason: err.to_string(),
            }),
        }
    }

    /// Register a rule after checking the method exists here.
    pub fn add_rule(&self, rule: Rule) -> Result<(), EndpointError> {
        self.descriptors.resolve(&rule.service, &rule.method)?;
        self.matcher.submit(rule)?;
        Ok(())
    }

    pub fn clear_rules(&self) {
        self.matcher.clear_all();
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().take() {
            warn!(label = %self.label, port = self.port(), "Endpoint dropped while running");
            let _ = handle.shutdown.send(());
            handle.probe.abort();
        }
    }
}

/// Where to dial to reach a listener bound to `addr`.
fn probe_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

async fn probe_until_ready(addr: SocketAddr, state: Arc<watch::Sender<Lifecycle>>) {
    loop {
        if !matches!(*state.borrow(), Lifecycle::Starting) {
            return;
        }

        if TcpStream::connect(addr).await.is_ok() {
            let flipped = state.send_if_modified(|s| {
                if matches!(s, Lifecycle::Starting) {
                    *s = Lifecycle::Ready;
                    true
                } else {
                    false
                }
            });
            if flipped {
                debug!(addr = %addr, "Endpoint ready");
            }
            return;
        }

        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}
