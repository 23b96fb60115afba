//! Redirecting proxy server.
//!
//! Owns the hudsucker proxy: picks the listening port, loads the root CA,
//! wires the [`RedirectHandler`] and the gated upstream connector, and
//! exposes start/stop.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use danheng_core::{DecisionEngine, RuleSet};
use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::hyper_util::client::legacy::connect::Connect;
use hudsucker::Proxy;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::{DecisionEvent, OnDecisionCallback, RedirectHandler};
use crate::port::{PortSource, RandomPortSource};
use crate::verifier::{https_connector, root_store};

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen_ip: IpAddr,
    /// Redirect rules shared by every session.
    pub rules: Arc<RuleSet>,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Extra PEM trust anchors for upstream certificates.
    pub upstream_ca: Option<PathBuf>,
    /// Port source used when the rules leave the port at 0.
    pub port_source: Arc<dyn PortSource>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listen_ip", &self.listen_ip)
            .field("rules", &self.rules)
            .field("ca_manager", &self.ca_manager)
            .field("upstream_ca", &self.upstream_ca)
            .field("port_source", &self.port_source)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration listening on localhost with the default CA
    /// directory.
    pub fn new(rules: RuleSet) -> Result<Self> {
        let ca_manager = CaManager::with_default_dir().map_err(ProxyError::Ca)?;
        Ok(Self::with_ca_manager(rules, ca_manager))
    }

    /// Creates a configuration using the given CA manager.
    pub fn with_ca_manager(rules: RuleSet, ca_manager: CaManager) -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rules: Arc::new(rules),
            ca_manager,
            upstream_ca: None,
            port_source: Arc::new(RandomPortSource::default()),
        }
    }

    /// Sets the listen address.
    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
        self
    }

    /// Trusts extra upstream CA certificates from a PEM file.
    pub fn with_upstream_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.upstream_ca = Some(path.into());
        self
    }

    /// Sets the port source.
    pub fn with_port_source(mut self, source: impl PortSource + 'static) -> Self {
        self.port_source = Arc::new(source);
        self
    }

    /// Resolves the listening address, drawing a port when none is set.
    pub fn resolve_addr(&self) -> Result<SocketAddr> {
        let port = match self.rules.proxy_bind_port() {
            0 => self.port_source.next_port(self.listen_ip)?,
            port => port,
        };
        Ok(SocketAddr::new(self.listen_ip, port))
    }
}

/// Redirecting MITM proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    addr: SocketAddr,
    on_decision: Option<OnDecisionCallback>,
}

impl ProxyServer {
    /// Creates a proxy server, resolving its port and ensuring the CA exists.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;
        let addr = config.resolve_addr()?;

        Ok(Self {
            config,
            addr,
            on_decision: None,
        })
    }

    /// Sets the callback for redirect and block events.
    pub fn on_decision<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DecisionEvent) + Send + Sync + 'static,
    {
        self.on_decision = Some(Arc::new(callback));
        self
    }

    /// Returns the address the proxy listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the CA certificate path clients must trust.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Returns the rules this server applies.
    pub fn rules(&self) -> &RuleSet {
        &self.config.rules
    }

    /// Loads the CA and builds the handler and the gated upstream connector.
    fn proxy_parts(
        &self,
    ) -> Result<(
        RcgenAuthority,
        impl Connect + Clone + Send + Sync + 'static,
        RedirectHandler,
    )> {
        let authority = self.config.ca_manager.ensure_ca().map_err(ProxyError::Ca)?;
        let engine = DecisionEngine::new(self.config.rules.clone());

        let roots = root_store(self.config.upstream_ca.as_deref())?;
        let connector = https_connector(roots, engine.clone())?;
        let handler = RedirectHandler::new(engine).with_decision_callback(self.on_decision.clone());

        Ok((authority, connector, handler))
    }

    /// Runs the proxy in the foreground until the listener fails.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the proxy in the foreground until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (authority, connector, handler) = self.proxy_parts()?;
        let proxy = Proxy::builder()
            .with_addr(self.addr)
            .with_ca(authority)
            .with_http_connector(connector)
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Starting redirect proxy on {}", self.addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        tokio::select! {
            result = proxy.start() => {
                result.map_err(|e| ProxyError::Proxy(e.to_string()))?;
            }
            _ = shutdown => {
                tracing::info!("Proxy shutdown signal received");
            }
        };

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let addr = self.addr;

        let (authority, connector, handler) = self.proxy_parts()?;
        let proxy = Proxy::builder()
            .with_addr(addr)
            .with_ca(authority)
            .with_http_connector(connector)
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Starting redirect proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {}
            };
            tracing::info!("Proxy server stopped");
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// Handle for controlling a running proxy server.
///
/// Dropping the handle also shuts the proxy down.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    stopped: AtomicBool,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("addr", &self.addr)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns true once shutdown has been signalled.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Signals the proxy to stop accepting connections. Only the first call
    /// has an effect.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Proxy shutdown signal received");
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy task to finish.
    pub async fn wait(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(&self) {
        self.shutdown();
        self.wait().await;
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
