// src/listener.rs
use crate::config::{Location, VirtualHost};
use crate::error::{ResponseError, WebservError, WebservResult};
use crate::http::RequestHead;
use crate::syscalls;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::info;

/// A bound listening socket and the virtual hosts reachable through it.
/// The first host is the default for requests whose `Host` matches no name.
pub struct Listener {
    fd: OwnedFd,
    addr: SocketAddr,
    hosts: Vec<VirtualHost>,
}

/// The host and location a request resolved to.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub host: &'a VirtualHost,
    pub location: &'a Location,
}

impl Listener {
    pub fn bind(addr: SocketAddr, hosts: Vec<VirtualHost>) -> WebservResult<Self> {
        if hosts.is_empty() {
            return Err(WebservError::Config(format!("no hosts for {}", addr)));
        }
        let fd = syscalls::create_listen_socket(&addr)?;
        let addr = syscalls::local_addr(fd.as_raw_fd())?;
        info!(%addr, hosts = hosts.len(), "listening");
        Ok(Self { fd, addr, hosts })
    }

    /// The bound address, with an ephemeral port already resolved.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn hosts(&self) -> &[VirtualHost] {
        &self.hosts
    }

    /// Adopt hosts whose own address could not be bound. Names already
    /// served here are skipped.
    pub fn merge_hosts(&mut self, hosts: Vec<VirtualHost>) {
        for host in hosts {
            if self.hosts.iter().any(|h| h.server_name == host.server_name) {
                continue;
            }
            info!(addr = %self.addr, server_name = %host.server_name, "host merged into wildcard listener");
            self.hosts.push(host);
        }
    }

    /// `Ok(None)` once the backlog is empty.
    pub fn accept(&self) -> io::Result<Option<OwnedFd>> {
        syscalls::accept_connection(self.fd.as_raw_fd())
    }

    /// Host whose `server_name` equals the request's `Host`, else the default.
    pub fn select_host(&self, head: &RequestHead) -> &VirtualHost {
        let wanted = head.host().unwrap_or("");
        self.hosts
            .iter()
            .find(|h| !h.server_name.is_empty() && h.server_name.eq_ignore_ascii_case(wanted))
            .unwrap_or(&self.hosts[0])
    }

    /// Host and location for a request, or the routing error: 404 when no
    /// location matches, 405 (with `Allow`) when the method is not permitted.
    pub fn resolve(&self, head: &RequestHead) -> Result<Route<'_>, ResponseError> {
        let host = self.select_host(head);
        let location = match_location(host, &head.path).ok_or_else(|| ResponseError::new(404))?;
        if !location.allows(head.method) {
            return Err(ResponseError::new(405).with_header("Allow", location.allow_header()));
        }
        Ok(Route { host, location })
    }
}

/// Longest matching location prefix; ties keep the first declared.
pub fn match_location<'a>(host: &'a VirtualHost, path: &str) -> Option<&'a Location> {
    let mut best: Option<&Location> = None;
    for loc in &host.locations {
        if !prefix_matches(&loc.path, path) {
            continue;
        }
        match best {
            Some(b) if b.path.len() >= loc.path.len() => {}
            _ => best = Some(loc),
        }
    }
    best
}

/// Segment-aware prefix test: `/img` matches `/img` and `/img/a.png` but
/// not `/images`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" || prefix == path {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Declared or received body size beyond the host limit.
pub fn check_body_size(host: &VirtualHost, size: usize) -> Result<(), ResponseError> {
    if size > host.max_body_size {
        return Err(ResponseError::new(413));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::http::Method;

    const HOSTS: &str = r#"
[[hosts]]
ip_address = "127.0.0.1"
port = 8080
server_name = "first"
client_max_body_size = "10B"

[[hosts.locations]]
path = "/"
root = "www"

[[hosts.locations]]
path = "/img"
root = "www/a"

[[hosts.locations]]
path = "/img"
root = "www/b"

[[hosts.locations]]
path = "/upload"
methods = ["POST", "DELETE"]

[[hosts]]
ip_address = "127.0.0.1"
port = 8080
server_name = "second"

[[hosts.locations]]
path = "/only"
"#;

    fn head(method: Method, path: &str, host: &str) -> RequestHead {
        RequestHead {
            method,
            path: path.into(),
            query: String::new(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), host.into())],
        }
    }

    fn hosts() -> Vec<VirtualHost> {
        Config::from_toml_str(HOSTS).unwrap().hosts
    }

    #[test]
    fn test_prefix_is_segment_aware() {
        assert!(prefix_matches("/", "/anything"));
        assert!(prefix_matches("/img", "/img"));
        assert!(prefix_matches("/img", "/img/a.png"));
        assert!(prefix_matches("/img/", "/img/a.png"));
        assert!(!prefix_matches("/img", "/images"));
        assert!(!prefix_matches("/img", "/"));
    }

    #[test]
    fn test_longest_prefix_then_first_declared() {
        let hosts = hosts();
        let loc = match_location(&hosts[0], "/img/cat.png").unwrap();
        assert_eq!(loc.root, std::path::PathBuf::from("www/a"));
        let loc = match_location(&hosts[0], "/imgs").unwrap();
        assert_eq!(loc.path, "/");
        assert!(match_location(&hosts[1], "/elsewhere").is_none());
    }

    #[test]
    fn test_resolve_distinguishes_errors() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), hosts()).unwrap();

        let route = listener.resolve(&head(Method::Get, "/img/x", "first")).unwrap();
        assert_eq!(route.location.path, "/img");

        let err = listener.resolve(&head(Method::Get, "/upload/x", "first")).unwrap_err();
        assert_eq!(err.status, 405);
        assert_eq!(err.headers, vec![("Allow".to_string(), "POST, DELETE".to_string())]);

        let err = listener.resolve(&head(Method::Get, "/nope", "second:8080")).unwrap_err();
        assert_eq!(err.status, 404);

        assert_eq!(check_body_size(route.host, 10), Ok(()));
        assert_eq!(check_body_size(route.host, 11).unwrap_err().status, 413);
    }

    #[test]
    fn test_unknown_host_uses_default() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), hosts()).unwrap();
        assert_eq!(listener.select_host(&head(Method::Get, "/", "other")).server_name, "first");
        assert_eq!(listener.select_host(&head(Method::Get, "/", "SECOND")).server_name, "second");
        assert_ne!(listener.addr().port(), 0);
    }

    #[test]
    fn test_merge_skips_known_names() {
        let mut all = hosts();
        let second = all.split_off(1);
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap(), all).unwrap();
        listener.merge_hosts(second.clone());
        listener.merge_hosts(second);
        assert_eq!(listener.hosts().len(), 2);
    }
}
