// src/server.rs
use crate::config::Config;
use crate::error::{WebservError, WebservResult};
use crate::listener::Listener;
use crate::metrics::ReactorMetrics;
use crate::reactor::{Reactor, ShutdownHandle};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// A configured server: listeners bound, reactor ready to run.
pub struct Server {
    reactor: Reactor,
}

impl Server {
    /// Bind one listener per distinct ip:port. A specific address that is
    /// already taken by this server's own wildcard listener on the same port
    /// has its hosts merged into that listener. Fails only when nothing could
    /// be bound.
    pub fn bind(config: Config) -> WebservResult<Self> {
        let mut listeners: Vec<Listener> = Vec::new();

        for (addr, hosts) in config.listener_groups() {
            match Listener::bind(addr, hosts.clone()) {
                Ok(listener) => listeners.push(listener),
                Err(WebservError::Io(e)) if e.kind() == io::ErrorKind::AddrInUse => {
                    let wildcard = listeners
                        .iter_mut()
                        .find(|l| l.addr().ip().is_unspecified() && l.addr().port() == addr.port());
                    match wildcard {
                        Some(listener) => listener.merge_hosts(hosts),
                        None => error!(%addr, "address already in use"),
                    }
                }
                Err(e) => error!(%addr, error = %e, "bind failed"),
            }
        }

        if listeners.is_empty() {
            return Err(WebservError::NoListeners);
        }

        let reactor = Reactor::new(listeners, &config)?;
        Ok(Self { reactor })
    }

    /// Bound addresses, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.reactor.listeners().iter().map(Listener::addr).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.reactor.shutdown_handle()
    }

    pub fn metrics(&self) -> Arc<ReactorMetrics> {
        self.reactor.metrics()
    }

    /// Run the event loop on the calling thread until shut down.
    pub fn run(mut self) -> WebservResult<()> {
        self.reactor.run()
    }

    /// Like [`run`](Self::run), with SIGINT/SIGTERM wired to a clean shutdown.
    pub fn serve(self) -> WebservResult<()> {
        let handle = self.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("signal received, shutting down");
            handle.shutdown();
        })?;
        self.run()
    }
}
