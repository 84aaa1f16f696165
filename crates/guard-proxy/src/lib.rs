//! Local MITM proxy. Accepts redirected HTTP/HTTPS flows on a loopback
//! listener, enforces filter policy, terminates client TLS with CA-minted
//! leaves, and relays allowed traffic to origin over verified TLS.

use std::io;
use std::sync::Arc;

use arc_swap::ArcSwap;
use guard_ca::CertificateAuthority;
use guard_filter::RuleSet;
use guard_observe::{EventSink, StatsRegistry};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

mod bypass;
mod connection;
mod delegate;
mod http;
mod relay;
mod runtime;
mod tls;

pub use bypass::BypassList;
pub use connection::ConnectionPhase;
pub use delegate::ProxyDelegate;
pub use runtime::ProxyConfig;

use runtime::ProxyRuntime;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid bypass pattern {pattern:?}: {reason}")]
    InvalidBypassPattern { pattern: String, reason: &'static str },
    #[error("TLS configuration failed: {0}")]
    TlsConfig(String),
    #[error("origin TLS to {host} failed: {detail}")]
    OriginTls { host: String, detail: String },
}

pub struct ProxyServer {
    runtime: Arc<ProxyRuntime>,
    rules: Arc<ArcSwap<RuleSet>>,
}

/// Running listener. Dropping the handle leaves the proxy running;
/// `stop()` cancels the acceptor and every in-flight connection.
pub struct ProxyHandle {
    pub local_addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<io::Result<()>>,
}

impl ProxyHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.acceptor.await;
    }
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        rules: Arc<RuleSet>,
        delegate: ProxyDelegate,
        events: Arc<dyn EventSink>,
        stats: Arc<StatsRegistry>,
    ) -> Result<Self, ProxyError> {
        let bypass = BypassList::compile(&config.bypass_patterns)?;
        stats.set_domains_indexed(rules.total_domains() as u64);
        Ok(Self {
            runtime: Arc::new(ProxyRuntime::new(
                config, ca, bypass, delegate, events, stats,
            )),
            rules: Arc::new(ArcSwap::from(rules)),
        })
    }

    /// Atomically publishes a new rule snapshot. Connections already past
    /// accept keep the snapshot they started with.
    pub fn reload_rules(&self, rules: Arc<RuleSet>) {
        self.runtime
            .stats
            .set_domains_indexed(rules.total_domains() as u64);
        self.rules.store(rules);
    }

    pub fn current_rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    /// Binds the listener and spawns the acceptor.
    pub async fn start(&self) -> Result<ProxyHandle, ProxyError> {
        let listener = TcpListener::bind((
            self.runtime.config.listen_addr.as_str(),
            self.runtime.config.listen_port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "proxy listener bound");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let runtime = Arc::clone(&self.runtime);
        let rules = Arc::clone(&self.rules);
        let acceptor = tokio::spawn(accept_loop(runtime, rules, listener, shutdown_rx));

        Ok(ProxyHandle {
            local_addr,
            shutdown,
            acceptor,
        })
    }
}

async fn accept_loop(
    runtime: Arc<ProxyRuntime>,
    rules: Arc<ArcSwap<RuleSet>>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                        continue;
                    }
                };
                let runtime = Arc::clone(&runtime);
                let snapshot = rules.load_full();
                runtime.stats.record_connection_open();
                connections.spawn(async move {
                    let stats = Arc::clone(&runtime.stats);
                    let result = connection::handle_connection(
                        runtime,
                        snapshot,
                        stream,
                        peer_addr.to_string(),
                    )
                    .await;
                    stats.record_connection_close();
                    if let Err(error) = result {
                        tracing::debug!(%error, "connection task ended with error");
                    }
                });
                // Reap whatever already finished so the set stays small.
                while connections.try_join_next().is_some() {}
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Cancellation propagates into each task; sockets close on drop.
    connections.shutdown().await;
    Ok(())
}
