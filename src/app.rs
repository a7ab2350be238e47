//! Hot-reload orchestration: builds a proxy instance per configuration and
//! swaps it into traffic on the same port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::observability::{metrics, LogHandle};
use crate::proxy::{engine, ReverseProxy};

/// A serving pipeline bound to a listener
struct Instance {
    proxy: Arc<ReverseProxy>,
    addr: SocketAddr,
    drain_timeout: Duration,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl Instance {
    /// Stop accepting, let in-flight requests finish, then force the rest
    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        match tokio::time::timeout(self.drain_timeout, &mut self.handle).await {
            Ok(Ok(Ok(()))) => info!("Instance on {} drained", self.addr),
            Ok(Ok(Err(e))) => warn!("Instance on {} stopped with error: {}", self.addr, e),
            Ok(Err(e)) => warn!("Instance on {} task failed: {}", self.addr, e),
            Err(_) => {
                warn!(
                    "Instance on {} did not drain within {:?}, terminating",
                    self.addr, self.drain_timeout
                );
                self.proxy.terminate();
                if tokio::time::timeout(Duration::from_secs(1), &mut self.handle).await.is_err() {
                    self.handle.abort();
                }
            }
        }
    }
}

enum State {
    Idle,
    Active(Instance),
}

/// Owns the currently serving instance and applies configuration changes.
///
/// A change builds the whole pipeline anew, binds a second listener on the
/// same port, starts serving, and only then stops the previous instance. Any
/// failure before the swap leaves the previous instance untouched. The state
/// lock covers construction and the swap; draining happens outside it.
pub struct App {
    state: Mutex<State>,
    log_handle: Option<LogHandle>,
    port_override: Option<u16>,
}

impl App {
    pub fn new(log_handle: Option<LogHandle>) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            log_handle,
            port_override: None,
        }
    }

    /// Listen on `port` regardless of what the configuration says
    pub fn with_port_override(mut self, port: Option<u16>) -> Self {
        self.port_override = port;
        self
    }

    /// Address the active instance is bound to
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            State::Active(instance) => Some(instance.addr),
            State::Idle => None,
        }
    }

    pub async fn active_proxy(&self) -> Option<Arc<ReverseProxy>> {
        match &*self.state.lock().await {
            State::Active(instance) => Some(instance.proxy.clone()),
            State::Idle => None,
        }
    }

    pub async fn reconfigure(&self, config: Arc<Config>) -> Result<()> {
        config.validate().context("Rejected configuration")?;

        let mut state = self.state.lock().await;

        // an ephemeral port sticks to the first instance's port
        let configured = self.port_override.unwrap_or(config.server.port);
        let port = match &*state {
            State::Active(instance) if configured == 0 => instance.addr.port(),
            _ => configured,
        };
        let addr = resolve(&config.server.host, port).await?;

        let proxy = Arc::new(ReverseProxy::from_config(&config).context("Failed to build proxy")?);
        let listener = engine::bind(addr).with_context(|| format!("Failed to bind {}", addr))?;
        let bound = listener.local_addr().context("Failed to read bound address")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(engine::serve(proxy.clone(), listener, async move {
            let _ = shutdown_rx.await;
        }));

        let instance = Instance {
            proxy,
            addr: bound,
            drain_timeout: config.server.drain_timeout,
            shutdown: Some(shutdown_tx),
            handle,
        };
        let previous = std::mem::replace(&mut *state, State::Active(instance));
        // readers and shutdown must not wait out the old instance's drain
        drop(state);

        if let Some(log_handle) = &self.log_handle {
            if let Err(e) = log_handle.apply(&config) {
                warn!("Failed to apply log level: {:#}", e);
            }
        }

        match previous {
            State::Active(old) => {
                info!(
                    "Swapping to {} with {} backends on {}",
                    config.load_balancer.method.as_str(),
                    config.backends.len(),
                    bound
                );
                old.stop().await;
            }
            State::Idle => info!("Started load balancer on {}", bound),
        }

        metrics::record_reload("applied");
        Ok(())
    }

    /// Apply the current snapshot, then every later one until the sender goes away.
    /// Only the first configuration is fatal; later failures keep the running instance.
    pub async fn run(&self, mut updates: watch::Receiver<Arc<Config>>) -> Result<()> {
        let initial = updates.borrow_and_update().clone();
        self.reconfigure(initial).await?;

        while updates.changed().await.is_ok() {
            let config = updates.borrow_and_update().clone();
            if let Err(e) = self.reconfigure(config).await {
                metrics::record_reload("failed");
                error!("Reload failed, keeping current configuration: {:#}", e);
            }
        }

        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let State::Active(instance) = std::mem::replace(&mut *state, State::Idle) {
            info!("Shutting down instance on {}", instance.addr);
            instance.stop().await;
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("No address for {}:{}", host, port))
}
