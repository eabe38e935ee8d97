// src/reactor.rs
use crate::cgi::ChildRegistry;
use crate::config::Config;
use crate::conn::{Connection, Context, Step};
use crate::error::WebservResult;
use crate::listener::Listener;
use crate::metrics::ReactorMetrics;
use crate::session::SessionStore;
use crate::slab::Slab;
use crate::syscalls::{self, Event, Events, Interest, Poller};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;
/// Wait timeout while CGI children are outstanding, so exits are reaped promptly.
const REAP_INTERVAL_MS: i32 = 50;
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// What a poller token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Listener(usize),
    Client(usize),
    CgiOutput(usize),
    CgiInput(usize),
    Waker,
}

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<OwnedFd>,
}

impl ShutdownHandle {
    /// Latch the flag and wake the poller. Safe to call more than once.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        // A full pipe already holds a wake-up
        let _ = syscalls::write_nonblocking(self.waker.as_raw_fd(), &[1]);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The single-threaded event loop.
///
/// Every registration gets a fresh token that is never reused. An event whose
/// token is no longer in `sources` belongs to something torn down earlier in
/// the same batch and is skipped; a source registered during a batch cannot
/// appear in it.
pub struct Reactor {
    poller: Poller,
    sources: HashMap<u64, Source>,
    next_token: u64,
    listeners: Vec<Listener>,
    connections: Slab<Connection>,
    sessions: SessionStore,
    children: ChildRegistry,
    interpreters: BTreeMap<String, PathBuf>,
    client_timeout: Option<Duration>,
    metrics: Arc<ReactorMetrics>,
    waker: OwnedFd,
    shutdown: ShutdownHandle,
}

impl Reactor {
    pub fn new(listeners: Vec<Listener>, config: &Config) -> WebservResult<Self> {
        let poller = Poller::new()?;
        let (waker, wake_tx) = syscalls::create_pipe()?;

        let mut reactor = Self {
            poller,
            sources: HashMap::new(),
            next_token: 0,
            listeners,
            connections: Slab::new(config.server.max_connections),
            sessions: SessionStore::new(),
            children: ChildRegistry::new(),
            interpreters: config.interpreters.clone(),
            client_timeout: config.server.client_timeout,
            metrics: Arc::new(ReactorMetrics::new()),
            waker,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(wake_tx),
            },
        };

        let token = reactor.fresh_token();
        reactor
            .poller
            .add(reactor.waker.as_raw_fd(), token, Interest::Read)?;
        reactor.sources.insert(token, Source::Waker);

        for idx in 0..reactor.listeners.len() {
            let token = reactor.fresh_token();
            let fd = reactor.listeners[idx].raw_fd();
            reactor.poller.add(fd, token, Interest::Read)?;
            reactor.sources.insert(token, Source::Listener(idx));
        }
        Ok(reactor)
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<ReactorMetrics> {
        self.metrics.clone()
    }

    fn fresh_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Run until shutdown is requested. Only a failing poller is fatal.
    pub fn run(&mut self) -> WebservResult<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut last_prune = Instant::now();
        info!(listeners = self.listeners.len(), "reactor running");

        while !self.shutdown.is_shutdown() {
            self.poller.wait(&mut events, self.wait_timeout())?;

            for ev in events.iter() {
                let Some(&source) = self.sources.get(&ev.token) else {
                    continue;
                };
                match source {
                    Source::Waker => self.drain_waker(),
                    Source::Listener(idx) => self.accept(idx),
                    Source::Client(id) => self.on_client(id, ev),
                    Source::CgiOutput(id) => self.on_cgi(id),
                    Source::CgiInput(id) => self.on_cgi_input(id),
                }
            }

            self.children.reap_all();

            if self.client_timeout.is_some() && last_prune.elapsed() >= PRUNE_INTERVAL {
                self.prune_idle();
                last_prune = Instant::now();
            }
        }

        self.close_all();
        Ok(())
    }

    fn wait_timeout(&self) -> i32 {
        if !self.children.is_empty() {
            REAP_INTERVAL_MS
        } else if self.client_timeout.is_some() {
            PRUNE_INTERVAL.as_millis() as i32
        } else {
            -1
        }
    }

    fn drain_waker(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(Some(n)) = syscalls::read_nonblocking(self.waker.as_raw_fd(), &mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    // ---- Accept ----

    fn accept(&mut self, idx: usize) {
        loop {
            let fd = match self.listeners[idx].accept() {
                Ok(Some(fd)) => fd,
                Ok(None) => return,
                Err(e) => {
                    warn!(addr = %self.listeners[idx].addr(), error = %e, "accept failed");
                    return;
                }
            };

            let token = self.fresh_token();
            let raw = fd.as_raw_fd();
            let id = match self.connections.insert(Connection::new(fd, idx, token)) {
                Ok(id) => id,
                Err(_rejected) => {
                    // Over capacity; dropping closes the socket
                    self.metrics.inc_rejected();
                    warn!(capacity = self.connections.capacity(), "connection limit reached");
                    continue;
                }
            };
            if let Err(e) = self.poller.add(raw, token, Interest::Read) {
                warn!(error = %e, "client registration failed");
                self.connections.remove(id);
                continue;
            }
            self.sources.insert(token, Source::Client(id));
            self.metrics.inc_accepted();
            debug!(id, fd = raw, "connection accepted");
        }
    }

    // ---- Dispatch ----

    fn on_client(&mut self, id: usize, ev: Event) {
        // A half-close is not a hangup: it arrives as a readable EOF
        if ev.hangup {
            debug!(id, "peer hung up");
            self.teardown(id);
            return;
        }

        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        let mut ctx = Context {
            listeners: &self.listeners,
            interpreters: &self.interpreters,
            sessions: &mut self.sessions,
            children: &mut self.children,
            metrics: &self.metrics,
        };
        let step = if ev.readable {
            conn.on_readable(&self.listeners[conn.listener()])
        } else if ev.writable {
            conn.on_writable(&mut ctx)
        } else {
            Step::Stay
        };
        self.apply(id, step);
    }

    fn on_cgi(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        let mut ctx = Context {
            listeners: &self.listeners,
            interpreters: &self.interpreters,
            sessions: &mut self.sessions,
            children: &mut self.children,
            metrics: &self.metrics,
        };
        let step = conn.on_cgi_readable(&mut ctx);
        self.apply(id, step);
    }

    fn on_cgi_input(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        let step = conn.on_cgi_writable();
        self.apply(id, step);
    }

    fn apply(&mut self, id: usize, step: Step) {
        match step {
            Step::Stay => {}
            Step::Rearm(interest) => self.rearm(id, interest),
            Step::CgiStarted => self.register_cgi(id),
            Step::CgiInputDone => self.unregister_cgi_input(id),
            Step::CgiDone => self.unregister_cgi(id),
            Step::Close => self.teardown(id),
        }
    }

    fn rearm(&mut self, id: usize, interest: Interest) {
        let Some(conn) = self.connections.get(id) else {
            return;
        };
        if let Err(e) = self.poller.modify(conn.raw_fd(), conn.token, interest) {
            warn!(id, error = %e, "re-registration failed");
            self.teardown(id);
        }
    }

    /// Poll the child's pipes and park the client socket, which then only
    /// reports errors and full hangups.
    fn register_cgi(&mut self, id: usize) {
        if let Err(e) = self.try_register_cgi(id) {
            warn!(id, error = %e, "cgi pipe registration failed");
            self.teardown(id);
        }
    }

    fn try_register_cgi(&mut self, id: usize) -> io::Result<()> {
        let out_token = self.fresh_token();
        let in_token = self.fresh_token();
        let Some(conn) = self.connections.get_mut(id) else {
            return Ok(());
        };

        // Tokens are recorded before each add so teardown can undo a partial setup
        if let Some(pipe) = conn.cgi_fd() {
            conn.cgi_token = Some(out_token);
            self.sources.insert(out_token, Source::CgiOutput(id));
            self.poller.add(pipe, out_token, Interest::Read)?;
        }
        if let Some(pipe) = conn.cgi_input_fd() {
            conn.cgi_input_token = Some(in_token);
            self.sources.insert(in_token, Source::CgiInput(id));
            self.poller.add(pipe, in_token, Interest::Write)?;
        }
        self.poller.modify(conn.raw_fd(), conn.token, Interest::Parked)
    }

    /// Body delivered (or refused): deregister and close the child's stdin.
    fn unregister_cgi_input(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if let Some(pipe) = conn.cgi_input_fd() {
            let _ = self.poller.delete(pipe);
        }
        if let Some(token) = conn.cgi_input_token.take() {
            self.sources.remove(&token);
        }
        conn.close_cgi_input();
    }

    /// Output drained: deregister and close both pipes, then wait to write.
    fn unregister_cgi(&mut self, id: usize) {
        self.unregister_cgi_input(id);
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if let Some(pipe) = conn.cgi_fd() {
            let _ = self.poller.delete(pipe);
        }
        if let Some(token) = conn.cgi_token.take() {
            self.sources.remove(&token);
        }
        conn.close_cgi_output();
        self.rearm(id, Interest::Write);
    }

    // ---- Teardown ----

    /// Free a connection and everything it owns. Removal from the slab is the
    /// first step, so a second call for the same id is a no-op.
    fn teardown(&mut self, id: usize) {
        let Some(mut conn) = self.connections.remove(id) else {
            return;
        };
        for pipe in [conn.cgi_fd(), conn.cgi_input_fd()].into_iter().flatten() {
            let _ = self.poller.delete(pipe);
        }
        for token in [conn.cgi_token.take(), conn.cgi_input_token.take()].into_iter().flatten() {
            self.sources.remove(&token);
        }
        conn.abort(&mut self.children);
        let _ = self.poller.delete(conn.raw_fd());
        self.sources.remove(&conn.token);
        self.metrics.inc_teardowns();
        debug!(id, state = ?conn.state(), "connection closed");
    }

    fn prune_idle(&mut self) {
        let Some(limit) = self.client_timeout else {
            return;
        };
        let now = Instant::now();
        for id in self.connections.keys() {
            let expired = self
                .connections
                .get(id)
                .is_some_and(|conn| conn.idle_for(now) >= limit);
            if expired {
                debug!(id, "idle timeout");
                self.teardown(id);
            }
        }
    }

    fn close_all(&mut self) {
        for id in self.connections.keys() {
            self.teardown(id);
        }
        self.children.shutdown();
        let m = self.metrics.snapshot();
        info!(
            accepted = m.accepted,
            rejected = m.rejected,
            responses = m.responses,
            cgi_runs = m.cgi_runs,
            teardowns = m.teardowns,
            bytes_sent = m.bytes_sent,
            "reactor stopped"
        );
    }
}
