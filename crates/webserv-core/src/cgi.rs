// src/cgi.rs
//! CGI child processes.
//!
//! A script runs as `<interpreter> <script>`. Its stdin and stdout are
//! non-blocking pipes that the reactor polls like any socket: the request
//! body is fed in as the child reads it, and output is collected as it
//! arrives. Children are owned by a [`ChildRegistry`] and reaped with
//! non-blocking `try_wait`, so the event loop never waits on a process.

use crate::config::VirtualHost;
use crate::error::ResponseError;
use crate::http::Request;
use crate::response::{Response, SERVER_NAME};
use crate::syscalls;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiState {
    /// Being set up; no output pipe yet.
    Init,
    /// Running. The output pipe is registered for reading.
    Forked,
    /// Output complete (or abandoned); the child may not be reaped yet.
    FinishedSet,
    /// Reaped and gone from the registry.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiWrite {
    /// Body bytes remain for the child's stdin.
    Pending,
    /// Everything was delivered, or the child stopped reading.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiRead {
    /// More output may follow.
    Pending,
    /// The child closed its stdout.
    Eof,
}

// ---- Child registry ----

/// Every child the server has spawned and not yet reaped, keyed by pid.
///
/// Owned by the reactor. Lookups go through this map, so a pid is never
/// waited on unless this process spawned it.
#[derive(Default)]
pub struct ChildRegistry {
    children: HashMap<u32, Child>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.children.contains_key(&pid)
    }

    pub fn track(&mut self, child: Child) -> u32 {
        let pid = child.id();
        self.children.insert(pid, child);
        pid
    }

    /// Non-blocking reap of one child. True once `pid` is no longer tracked.
    pub fn try_reap(&mut self, pid: u32) -> bool {
        let Some(child) = self.children.get_mut(&pid) else {
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "cgi child reaped");
                self.children.remove(&pid);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid, error = %e, "cgi child wait failed, dropping it");
                self.children.remove(&pid);
                true
            }
        }
    }

    /// Reap every child that has exited. Returns how many were reaped.
    pub fn reap_all(&mut self) -> usize {
        let pids: Vec<u32> = self.children.keys().copied().collect();
        pids.into_iter().filter(|&pid| self.try_reap(pid)).count()
    }

    /// SIGKILL a child. It stays tracked until a later reap collects it.
    pub fn terminate(&mut self, pid: u32) {
        if let Some(child) = self.children.get_mut(&pid) {
            match child.kill() {
                Ok(()) => info!(pid, "cgi child killed"),
                // Already exited, waiting to be reaped
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
                Err(e) => warn!(pid, error = %e, "cgi child kill failed"),
            }
        }
    }

    /// Kill and reap everything. Used on shutdown.
    pub fn shutdown(&mut self) {
        for (pid, mut child) in self.children.drain() {
            let _ = child.kill();
            if let Err(e) = child.wait() {
                warn!(pid, error = %e, "cgi child wait failed on shutdown");
            }
        }
    }
}

impl Drop for ChildRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---- Setup ----

/// Interpreter for a script: its extension must have a configured
/// interpreter (else 404) that the host enables (else 403).
pub fn resolve_interpreter<'a>(
    script: &Path,
    host: &VirtualHost,
    interpreters: &'a BTreeMap<String, PathBuf>,
) -> Result<&'a Path, ResponseError> {
    let ext = script
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ResponseError::new(404))?;
    let interpreter = interpreters.get(ext).ok_or_else(|| ResponseError::new(404))?;
    if !host.cgis.iter().any(|c| c == ext) {
        return Err(ResponseError::new(403));
    }
    Ok(interpreter)
}

/// Environment handed to a CGI child.
pub fn cgi_environment(request: &Request, host: &VirtualHost, server_port: u16) -> Vec<(String, String)> {
    let server_name = if host.server_name.is_empty() {
        host.ip_address.to_string()
    } else {
        host.server_name.clone()
    };

    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_NAME.to_string()),
        ("SERVER_NAME".to_string(), server_name),
        ("SERVER_PORT".to_string(), server_port.to_string()),
        ("SERVER_PROTOCOL".to_string(), request.head.version.clone()),
        ("REQUEST_METHOD".to_string(), request.method().to_string()),
        ("QUERY_STRING".to_string(), request.head.query.clone()),
        ("SCRIPT_NAME".to_string(), request.path().to_string()),
        ("PATH_INFO".to_string(), request.path().to_string()),
    ];
    if let Some(cookie) = request.header("cookie") {
        env.push(("HTTP_COOKIE".to_string(), cookie.to_string()));
    }
    if request.method().requires_body() {
        env.push((
            "CONTENT_TYPE".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ));
        env.push(("CONTENT_LENGTH".to_string(), request.body.len().to_string()));
    }
    env
}

// ---- Process ----

/// One running script, owned by the connection that started it.
pub struct CgiProcess {
    pid: u32,
    stdin: Option<OwnedFd>,
    input: Vec<u8>,
    input_written: usize,
    stdout: Option<OwnedFd>,
    output: Vec<u8>,
    state: CgiState,
}

impl CgiProcess {
    /// Start `interpreter script` with `body` queued for its stdin.
    ///
    /// On success the child is tracked by `children`. Its stdout, and its
    /// stdin when there is a body to deliver, are non-blocking descriptors
    /// ready to be polled; with no body stdin is closed at once. Every failure path closes
    /// what it opened: a missing script is 404, anything else 500.
    pub fn spawn(
        interpreter: &Path,
        script: &Path,
        env: &[(String, String)],
        body: &[u8],
        children: &mut ChildRegistry,
    ) -> Result<Self, ResponseError> {
        let script = std::fs::canonicalize(script)?;
        if !script.is_file() {
            return Err(ResponseError::new(404));
        }

        let mut command = Command::new(interpreter);
        command
            .arg(&script)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            warn!(interpreter = %interpreter.display(), error = %e, "cgi spawn failed");
            ResponseError::new(500)
        })?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let pid = children.track(child);

        let mut process = Self {
            pid,
            stdin: None,
            input: Vec::new(),
            input_written: 0,
            stdout: None,
            output: Vec::new(),
            state: CgiState::Init,
        };

        let Some(stdout) = stdout else {
            children.terminate(pid);
            return Err(ResponseError::new(500));
        };
        let stdout = OwnedFd::from(stdout);
        if let Err(e) = syscalls::set_nonblocking(stdout.as_raw_fd()) {
            warn!(pid, error = %e, "cgi pipe setup failed");
            children.terminate(pid);
            return Err(ResponseError::new(500));
        }
        process.stdout = Some(stdout);

        if let Some(stdin) = stdin
            && !body.is_empty()
        {
            let stdin = OwnedFd::from(stdin);
            if let Err(e) = syscalls::set_nonblocking(stdin.as_raw_fd()) {
                warn!(pid, error = %e, "cgi pipe setup failed");
                children.terminate(pid);
                return Err(ResponseError::new(500));
            }
            process.stdin = Some(stdin);
            process.input = body.to_vec();
        }

        process.state = CgiState::Forked;
        info!(pid, script = %script.display(), "cgi spawned");
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> CgiState {
        self.state
    }

    /// The output pipe, while it is open.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// The input pipe, while body bytes remain to be written.
    pub fn input_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// One non-blocking write of the remaining body to the child's stdin.
    pub fn write_input(&mut self) -> io::Result<CgiWrite> {
        let Some(fd) = &self.stdin else {
            return Ok(CgiWrite::Done);
        };
        match syscalls::write_nonblocking(fd.as_raw_fd(), &self.input[self.input_written..]) {
            Ok(None) => Ok(CgiWrite::Pending),
            Ok(Some(n)) => {
                self.input_written += n;
                if self.input_written >= self.input.len() {
                    Ok(CgiWrite::Done)
                } else {
                    Ok(CgiWrite::Pending)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(pid = self.pid, written = self.input_written, "cgi closed stdin early");
                Ok(CgiWrite::Done)
            }
            Err(e) => Err(e),
        }
    }

    /// Close the input pipe, giving the child EOF. It must already be out
    /// of the poller.
    pub fn close_input(&mut self) {
        self.stdin = None;
        self.input = Vec::new();
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// One non-blocking read from the child's stdout.
    pub fn read_output(&mut self) -> io::Result<CgiRead> {
        let Some(fd) = &self.stdout else {
            return Ok(CgiRead::Eof);
        };
        let mut buf = [0u8; READ_CHUNK];
        match syscalls::read_nonblocking(fd.as_raw_fd(), &mut buf)? {
            None => Ok(CgiRead::Pending),
            Some(0) => {
                self.state = CgiState::FinishedSet;
                Ok(CgiRead::Eof)
            }
            Some(n) => {
                self.output.extend_from_slice(&buf[..n]);
                Ok(CgiRead::Pending)
            }
        }
    }

    /// Close the output pipe. It must already be out of the poller.
    pub fn close_output(&mut self) {
        self.stdout = None;
    }

    /// Stop waiting on the child: kill it if it is still producing output.
    pub fn abort(&mut self, children: &mut ChildRegistry) {
        if matches!(self.state, CgiState::Init | CgiState::Forked) {
            children.terminate(self.pid);
            self.state = CgiState::FinishedSet;
        }
        self.try_finish(children);
    }

    /// Advance to `Finished` once the child has been reaped.
    pub fn try_finish(&mut self, children: &mut ChildRegistry) -> CgiState {
        if self.state == CgiState::FinishedSet && children.try_reap(self.pid) {
            self.state = CgiState::Finished;
        }
        self.state
    }

    /// The response described by everything the child wrote.
    pub fn response(&self) -> Response {
        interpret_output(&self.output)
    }
}

/// Split child output at the first blank line into headers and body.
///
/// `Content-Type` sets the response type, other `Key: Value` lines become
/// headers. Output without a blank line is all body.
pub fn interpret_output(output: &[u8]) -> Response {
    let mut res = Response::new(200);
    let Some((head, body)) = split_header_block(output) else {
        res.body = output.to_vec();
        return res;
    };

    for line in String::from_utf8_lossy(head).lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            continue;
        }
        if key.eq_ignore_ascii_case("content-type") {
            res.content_type = Some(value.to_string());
        } else if key.eq_ignore_ascii_case("content-length")
            || key.eq_ignore_ascii_case("connection")
        {
            // Framing is ours
        } else {
            res.headers.push((key.to_string(), value.to_string()));
        }
    }
    res.body = body.to_vec();
    res
}

fn split_header_block(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(output, b"\r\n\r\n").map(|p| (p, 4));
    let lf = find(output, b"\n\n").map(|p| (p, 2));
    let (pos, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((&output[..pos], &output[pos + len..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
