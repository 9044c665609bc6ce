use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use tollgate_core::backend::{BackendKind, BackendRegistry};
use tollgate_core::connection::Connection;
use tollgate_core::net::{Listener, NetworkAddress};
use tollgate_core::policy::PolicyHook;

use crate::config::Config;

/// Default port for backend addresses given without one.
const MYSQL_PORT: u16 = 3306;

/// A bound proxy instance: listener, backend registry, and the shared
/// shutdown switch.
pub struct Proxy {
    listener: Listener,
    registry: Arc<BackendRegistry>,
    policy: Arc<dyn PolicyHook>,
    config: Config,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Proxy {
    /// Bind the listener and register the configured backends. An
    /// unusable address or a duplicate backend fails the whole startup;
    /// the process should exit nonzero.
    pub async fn bind(config: Config, policy: Arc<dyn PolicyHook>) -> anyhow::Result<Proxy> {
        let registry = Arc::new(BackendRegistry::new(config.pool_options()));

        for (addresses, kind) in [
            (&config.backend_addresses, BackendKind::Rw),
            (&config.read_only_backend_addresses, BackendKind::Ro),
        ] {
            for address in addresses {
                let parsed = NetworkAddress::parse(address, MYSQL_PORT)
                    .with_context(|| format!("backend address {address:?}"))?;

                registry
                    .add(parsed, kind)
                    .with_context(|| format!("registering backend {address:?}"))?;
            }
        }

        let listen = NetworkAddress::parse(&config.proxy_address, 4040)
            .with_context(|| format!("listen address {:?}", config.proxy_address))?;

        let listener = Listener::bind(&listen)
            .await
            .with_context(|| format!("binding {listen}"))?;

        tracing::info!(address = %listen, "proxy listening");

        let (shutdown, _) = watch::channel(false);

        Ok(Proxy {
            listener,
            registry,
            policy,
            config,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn registry(&self) -> Arc<BackendRegistry> {
        Arc::clone(&self.registry)
    }

    /// The bound address, useful when listening on an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok().flatten()
    }

    /// A handle that stops the accept loop and drains connections when
    /// sent `true`.
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown)
    }

    /// Accept clients until shutdown; each connection runs on its own
    /// task.
    pub async fn serve(self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let options = self.config.connection_options();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    tracing::info!("shutting down, draining connections");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let client = match accepted {
                        Ok(client) => client,
                        Err(e) => {
                            tracing::warn!("accept failed: {e}");
                            continue;
                        }
                    };

                    let connection = Connection::new(
                        client,
                        Arc::clone(&self.registry),
                        Arc::clone(&self.policy),
                        options.clone(),
                        self.shutdown.subscribe(),
                    );

                    tokio::spawn(connection.run());
                }
            }
        }
    }
}

/// Resolve signals into the shutdown switch: `SIGTERM`/`SIGINT` request
/// a drain, `SIGHUP` asks for log rotation (delegated to the log
/// sink), and `SIGPIPE` stays ignored as Rust leaves it.
pub async fn watch_signals(shutdown: Arc<watch::Sender<bool>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!("cannot install SIGTERM handler: {e}");
            return;
        }
    };

    let mut hup = match signal(SignalKind::hangup()) {
        Ok(hup) => hup,
        Err(e) => {
            tracing::error!("cannot install SIGHUP handler: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                let _ = shutdown.send(true);
                return;
            }

            _ = term.recv() => {
                tracing::info!("SIGTERM received");
                let _ = shutdown.send(true);
                return;
            }

            _ = hup.recv() => {
                // rotation itself is the log sink's business
                tracing::info!("SIGHUP received, log rotation requested");
            }
        }
    }
}
