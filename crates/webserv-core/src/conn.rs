// src/conn.rs
use crate::cgi::{self, CgiProcess, CgiRead, CgiState, CgiWrite, ChildRegistry};
use crate::config::VirtualHost;
use crate::error::ResponseError;
use crate::handlers;
use crate::http::{Method, Request};
use crate::listener::{self, Listener};
use crate::metrics::ReactorMetrics;
use crate::parser::{Progress, RequestBuffer};
use crate::response::Response;
use crate::session::SessionStore;
use crate::syscalls::{self, Interest};
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const READ_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accumulating the request.
    Reading,
    /// Request (or an early error response) is ready; dispatch happens on
    /// the next write event. Stays here while a CGI child runs.
    ReadyToWrite,
    /// A response exists and is about to be serialized.
    Building,
    /// Sending the serialized response.
    Writing,
    /// Everything sent. Terminal.
    FinishedWriting,
}

/// What the reactor has to do after a connection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Stay,
    /// Re-register the socket with a new interest.
    Rearm(Interest),
    /// A CGI child started: register its pipes and park the socket.
    CgiStarted,
    /// The request body is fully in the child's stdin: drop that pipe.
    CgiInputDone,
    /// CGI output is complete: drop the pipe and wait for writability.
    CgiDone,
    /// Tear the connection down.
    Close,
}

/// Reactor state a connection borrows while it dispatches.
pub struct Context<'a> {
    pub listeners: &'a [Listener],
    pub interpreters: &'a BTreeMap<String, PathBuf>,
    pub sessions: &'a mut SessionStore,
    pub children: &'a mut ChildRegistry,
    pub metrics: &'a ReactorMetrics,
}

enum Outcome {
    Respond(Response),
    Cgi(CgiProcess),
}

/// One client, from accept to the last byte of its single response.
pub struct Connection {
    fd: OwnedFd,
    listener: usize,
    state: ConnState,
    input: RequestBuffer,
    request: Option<Request>,
    response: Option<Response>,
    output: Vec<u8>,
    written: usize,
    cgi: Option<CgiProcess>,
    last_active: Instant,
    pub(crate) token: u64,
    pub(crate) cgi_token: Option<u64>,
    pub(crate) cgi_input_token: Option<u64>,
}

impl Connection {
    pub fn new(fd: OwnedFd, listener: usize, token: u64) -> Self {
        Self {
            fd,
            listener,
            state: ConnState::Reading,
            input: RequestBuffer::new(),
            request: None,
            response: None,
            output: Vec::new(),
            written: 0,
            cgi: None,
            last_active: Instant::now(),
            token,
            cgi_token: None,
            cgi_input_token: None,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn listener(&self) -> usize {
        self.listener
    }

    /// Output pipe of the running CGI child, while it is open.
    pub fn cgi_fd(&self) -> Option<RawFd> {
        self.cgi.as_ref().and_then(CgiProcess::raw_fd)
    }

    /// Input pipe of the running CGI child, while body bytes remain.
    pub fn cgi_input_fd(&self) -> Option<RawFd> {
        self.cgi.as_ref().and_then(CgiProcess::input_fd)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    // ---- READING ----

    /// One non-blocking read, then re-scan the accumulated bytes.
    pub fn on_readable(&mut self, listener: &Listener) -> Step {
        if self.state != ConnState::Reading {
            return Step::Stay;
        }
        self.touch();

        let mut buf = [0u8; READ_BUF_SIZE];
        let n = match syscalls::read_nonblocking(self.raw_fd(), &mut buf) {
            Ok(None) => return Step::Stay,
            Ok(Some(0)) if self.input.is_empty() => {
                debug!(fd = self.raw_fd(), "peer closed before sending");
                return Step::Close;
            }
            Ok(Some(0)) => {
                debug!(fd = self.raw_fd(), "peer closed mid-request");
                return self.reject(ResponseError::new(400), listener);
            }
            Ok(Some(n)) => n,
            Err(e) => {
                debug!(fd = self.raw_fd(), error = %e, "read failed");
                return Step::Close;
            }
        };
        self.input.extend(&buf[..n]);

        let progress = match self.input.advance() {
            Ok(p) => p,
            Err(e) => {
                debug!(fd = self.raw_fd(), error = ?e, "malformed request");
                return self.reject(ResponseError::new(400), listener);
            }
        };

        let size = self.input.content_length().max(self.input.body_received());
        let over_limit = self
            .input
            .head()
            .and_then(|head| listener::check_body_size(listener.select_host(head), size).err());
        if let Some(err) = over_limit {
            return self.reject(err, listener);
        }

        match progress {
            Progress::Incomplete => Step::Stay,
            Progress::Complete => {
                self.request = self.input.take_request();
                if let Some(req) = &self.request {
                    debug!(method = %req.method(), path = %req.path(), "request complete");
                }
                self.state = ConnState::ReadyToWrite;
                Step::Rearm(Interest::Write)
            }
        }
    }

    /// Skip dispatch and answer with an error page.
    fn reject(&mut self, err: ResponseError, listener: &Listener) -> Step {
        let host = match self.input.head() {
            Some(head) => listener.select_host(head),
            None => &listener.hosts()[0],
        };
        self.response = Some(error_response(err, Some(host)));
        self.state = ConnState::ReadyToWrite;
        Step::Rearm(Interest::Write)
    }

    // ---- READY_TO_WRITE / BUILDING / WRITING ----

    pub fn on_writable(&mut self, ctx: &mut Context<'_>) -> Step {
        match self.state {
            ConnState::ReadyToWrite => {
                if self.cgi.is_some() {
                    return Step::Stay;
                }
                if self.response.is_none() && self.dispatch(ctx) {
                    return Step::CgiStarted;
                }
                self.state = ConnState::Building;
                self.build(ctx);
                self.write(ctx)
            }
            ConnState::Building => {
                self.build(ctx);
                self.write(ctx)
            }
            ConnState::Writing => self.write(ctx),
            ConnState::Reading | ConnState::FinishedWriting => Step::Stay,
        }
    }

    /// Route the request once. True when a CGI child took it over.
    fn dispatch(&mut self, ctx: &mut Context<'_>) -> bool {
        let listeners = ctx.listeners;
        let listener = &listeners[self.listener];
        let Some(request) = &self.request else {
            self.response = Some(error_response(ResponseError::new(400), None));
            return false;
        };

        match route(request, listener, ctx.interpreters, ctx.children) {
            Ok(Outcome::Cgi(process)) => {
                ctx.metrics.inc_cgi_runs();
                self.cgi = Some(process);
                true
            }
            Ok(Outcome::Respond(response)) => {
                self.response = Some(response);
                false
            }
            Err(err) => {
                debug!(status = err.status, path = %request.path(), "request refused");
                let host = listener.select_host(&request.head);
                self.response = Some(error_response(err, Some(host)));
                false
            }
        }
    }

    /// Session post-processing, then serialize into the output buffer.
    fn build(&mut self, ctx: &mut Context<'_>) {
        let mut response = self
            .response
            .take()
            .unwrap_or_else(|| Response::error_page(500, None));
        ctx.sessions.apply(self.request.as_ref(), &mut response);
        self.output = response.serialize();
        self.written = 0;
        debug!(status = response.status, bytes = self.output.len(), "response built");
        self.response = Some(response);
        self.state = ConnState::Writing;
        ctx.metrics.inc_responses();
    }

    /// One non-blocking send of whatever is left.
    fn write(&mut self, ctx: &mut Context<'_>) -> Step {
        match syscalls::send_nonblocking(self.raw_fd(), &self.output[self.written..]) {
            Ok(None) => Step::Stay,
            Ok(Some(n)) => {
                self.touch();
                self.written += n;
                ctx.metrics.add_bytes(n);
                if self.written >= self.output.len() {
                    self.state = ConnState::FinishedWriting;
                    Step::Close
                } else {
                    Step::Stay
                }
            }
            Err(e) => {
                debug!(fd = self.raw_fd(), error = %e, "write failed");
                Step::Close
            }
        }
    }

    // ---- CGI ----

    /// One non-blocking read from the CGI output pipe.
    pub fn on_cgi_readable(&mut self, ctx: &mut Context<'_>) -> Step {
        let Some(cgi) = self.cgi.as_mut() else {
            return Step::Stay;
        };
        self.last_active = Instant::now();

        let response = match cgi.read_output() {
            Ok(CgiRead::Pending) => return Step::Stay,
            Ok(CgiRead::Eof) => {
                cgi.try_finish(ctx.children);
                cgi.response()
            }
            Err(e) => {
                warn!(pid = cgi.pid(), error = %e, "cgi output read failed");
                cgi.abort(ctx.children);
                let host = self
                    .request
                    .as_ref()
                    .map(|req| ctx.listeners[self.listener].select_host(&req.head));
                error_response(ResponseError::new(500), host)
            }
        };
        self.response = Some(response);
        self.state = ConnState::Building;
        Step::CgiDone
    }

    /// One non-blocking write of the request body into the CGI child.
    pub fn on_cgi_writable(&mut self) -> Step {
        let Some(cgi) = self.cgi.as_mut() else {
            return Step::Stay;
        };
        self.last_active = Instant::now();
        match cgi.write_input() {
            Ok(CgiWrite::Pending) => Step::Stay,
            Ok(CgiWrite::Done) => Step::CgiInputDone,
            Err(e) => {
                // The output side still decides the response
                warn!(pid = cgi.pid(), error = %e, "cgi input write failed");
                Step::CgiInputDone
            }
        }
    }

    /// True while a CGI child is still producing output.
    pub fn in_cgi(&self) -> bool {
        self.cgi
            .as_ref()
            .is_some_and(|c| matches!(c.state(), CgiState::Init | CgiState::Forked))
    }

    /// Close the CGI input pipe after it left the poller.
    pub fn close_cgi_input(&mut self) {
        if let Some(cgi) = self.cgi.as_mut() {
            cgi.close_input();
        }
    }

    /// Close the CGI output pipe after it left the poller.
    pub fn close_cgi_output(&mut self) {
        if let Some(cgi) = self.cgi.as_mut() {
            cgi.close_output();
        }
    }

    /// Teardown hook: a child still running is killed, never left behind.
    pub fn abort(&mut self, children: &mut ChildRegistry) {
        if let Some(cgi) = self.cgi.as_mut() {
            cgi.abort(children);
        }
    }
}

fn route(
    request: &Request,
    listener: &Listener,
    interpreters: &BTreeMap<String, PathBuf>,
    children: &mut ChildRegistry,
) -> Result<Outcome, ResponseError> {
    let route = listener.resolve(&request.head)?;
    let location = route.location;
    let wants_cgi = location.cgi
        && location.redirect.is_none()
        && matches!(request.method(), Method::Get | Method::Post);
    if !wants_cgi {
        return handlers::handle(&route, request).map(Outcome::Respond);
    }

    let script = handlers::resolve_path(location, request.path())?;
    let interpreter = cgi::resolve_interpreter(&script, route.host, interpreters)?;
    let env = cgi::cgi_environment(request, route.host, listener.addr().port());
    CgiProcess::spawn(interpreter, &script, &env, &request.body, children).map(Outcome::Cgi)
}

fn error_response(err: ResponseError, host: Option<&VirtualHost>) -> Response {
    let mut response = Response::error_page(err.status, host);
    for (k, v) in err.headers {
        response.set_header(k, v);
    }
    response
}
