//! Server configuration, loaded from a TOML file.
//!
//! The file is deserialized into private `*File` structs mirroring its
//! layout, then validated and converted into the immutable [`Config`] the
//! reactor consumes. Validation rejects the whole file on the first bad entry.
//!
//! ```toml
//! [server]
//! max_connections = 1024
//!
//! [cgi.interpreters]
//! py = "/usr/bin/python3"
//!
//! [[hosts]]
//! port = 8080
//! server_name = "localhost"
//! client_max_body_size = "1M"
//! cgis = ["py"]
//!
//! [[hosts.locations]]
//! path = "/"
//! root = "www"
//! methods = ["GET", "POST"]
//! ```

use crate::error::{WebservError, WebservResult};
use crate::http::Method;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_BODY_SIZE: &str = "100M";
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Validated configuration for the whole process.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerSettings,
    /// CGI extension (without the dot) to interpreter binary.
    pub interpreters: BTreeMap<String, PathBuf>,
    pub hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub max_connections: usize,
    /// Idle deadline per connection. `None` disables timeouts.
    pub client_timeout: Option<Duration>,
}

/// One `[[hosts]]` entry.
#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub ip_address: IpAddr,
    pub port: u16,
    pub server_name: String,
    pub max_body_size: usize,
    pub error_pages: BTreeMap<u16, PathBuf>,
    /// Interpreter extensions enabled for this host.
    pub cgis: Vec<String>,
    /// Routes in declaration order.
    pub locations: Vec<Location>,
}

impl VirtualHost {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_address, self.port)
    }
}

/// One `[[hosts.locations]]` entry.
#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub root: PathBuf,
    pub methods: Vec<Method>,
    pub index: String,
    pub directory_listing: bool,
    pub redirect: Option<String>,
    pub upload_path: Option<PathBuf>,
    pub cgi: bool,
}

impl Location {
    pub fn allows(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Value for an `Allow` header.
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ---- File schema ----

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    server: ServerFile,
    #[serde(default)]
    cgi: CgiFile,
    #[serde(default)]
    hosts: Vec<HostFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerFile {
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    client_timeout_secs: Option<u64>,
}

impl Default for ServerFile {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            client_timeout_secs: None,
        }
    }
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CgiFile {
    #[serde(default = "default_interpreters")]
    interpreters: BTreeMap<String, PathBuf>,
}

impl Default for CgiFile {
    fn default() -> Self {
        Self {
            interpreters: default_interpreters(),
        }
    }
}

fn default_interpreters() -> BTreeMap<String, PathBuf> {
    BTreeMap::from([
        ("php".to_string(), PathBuf::from("/usr/bin/php")),
        ("py".to_string(), PathBuf::from("/usr/bin/python3")),
    ])
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostFile {
    ip_address: Option<String>,
    port: Option<i64>,
    server_name: Option<String>,
    client_max_body_size: Option<String>,
    #[serde(default)]
    error_pages: BTreeMap<String, PathBuf>,
    #[serde(default)]
    cgis: Vec<String>,
    #[serde(default)]
    locations: Vec<LocationFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocationFile {
    path: String,
    root: Option<PathBuf>,
    methods: Option<Vec<String>>,
    index: Option<String>,
    #[serde(default)]
    directory_listing: bool,
    redirect: Option<String>,
    upload_path: Option<PathBuf>,
    cgi: Option<bool>,
}

// ---- Loading & validation ----

impl Config {
    pub fn load(path: impl AsRef<Path>) -> WebservResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            WebservError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> WebservResult<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        file.validate()
    }

    /// Hosts grouped by bind address, in order of first appearance.
    /// The first host of each group is that address's default.
    pub fn listener_groups(&self) -> Vec<(SocketAddr, Vec<VirtualHost>)> {
        let mut groups: Vec<(SocketAddr, Vec<VirtualHost>)> = Vec::new();
        for host in &self.hosts {
            let addr = host.socket_addr();
            match groups.iter_mut().find(|(a, _)| *a == addr) {
                Some((_, hosts)) => hosts.push(host.clone()),
                None => groups.push((addr, vec![host.clone()])),
            }
        }
        groups
    }
}

fn invalid(msg: impl Into<String>) -> WebservError {
    WebservError::Config(msg.into())
}

impl ConfigFile {
    fn validate(self) -> WebservResult<Config> {
        if self.hosts.is_empty() {
            return Err(invalid("at least one [[hosts]] entry is required"));
        }
        if self.server.max_connections == 0 {
            return Err(invalid("server.max_connections must be positive"));
        }

        let mut hosts: Vec<VirtualHost> = Vec::with_capacity(self.hosts.len());
        for (i, raw) in self.hosts.into_iter().enumerate() {
            let host = raw.validate(i, &self.cgi.interpreters)?;
            let duplicate = hosts.iter().any(|h| {
                h.socket_addr() == host.socket_addr() && h.server_name == host.server_name
            });
            if duplicate {
                return Err(invalid(format!(
                    "hosts[{}]: server_name {:?} is not unique for {}",
                    i,
                    host.server_name,
                    host.socket_addr()
                )));
            }
            hosts.push(host);
        }

        Ok(Config {
            server: ServerSettings {
                max_connections: self.server.max_connections,
                client_timeout: self.server.client_timeout_secs.map(Duration::from_secs),
            },
            interpreters: self.cgi.interpreters,
            hosts,
        })
    }
}

impl HostFile {
    fn validate(
        self,
        i: usize,
        interpreters: &BTreeMap<String, PathBuf>,
    ) -> WebservResult<VirtualHost> {
        let ip_address = match self.ip_address.as_deref() {
            Some(ip) => ip
                .parse()
                .map_err(|_| invalid(format!("hosts[{}]: bad ip_address {:?}", i, ip)))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let port = match self.port {
            Some(p) if (1..=65535).contains(&p) => p as u16,
            Some(p) => return Err(invalid(format!("hosts[{}]: port {} out of range", i, p))),
            None => return Err(invalid(format!("hosts[{}]: port is mandatory", i))),
        };

        let size = self
            .client_max_body_size
            .as_deref()
            .unwrap_or(DEFAULT_MAX_BODY_SIZE);
        let max_body_size = parse_body_size(size).ok_or_else(|| {
            invalid(format!("hosts[{}]: bad client_max_body_size {:?}", i, size))
        })?;

        let mut error_pages = BTreeMap::new();
        for (code, page) in self.error_pages {
            let status: u16 = code
                .parse()
                .ok()
                .filter(|c| (400..=599).contains(c))
                .ok_or_else(|| invalid(format!("hosts[{}]: bad error page code {:?}", i, code)))?;
            if !is_html(&page.to_string_lossy()) {
                return Err(invalid(format!(
                    "hosts[{}]: error page {} must be .html or .htm",
                    i,
                    page.display()
                )));
            }
            error_pages.insert(status, page);
        }

        for (n, ext) in self.cgis.iter().enumerate() {
            if !interpreters.contains_key(ext) {
                return Err(invalid(format!(
                    "hosts[{}]: cgi {:?} has no interpreter",
                    i, ext
                )));
            }
            if self.cgis[..n].contains(ext) {
                return Err(invalid(format!("hosts[{}]: cgi {:?} listed twice", i, ext)));
            }
        }

        let locations = self
            .locations
            .into_iter()
            .enumerate()
            .map(|(j, loc)| loc.validate(i, j))
            .collect::<WebservResult<Vec<_>>>()?;

        Ok(VirtualHost {
            ip_address,
            port,
            server_name: self.server_name.unwrap_or_default(),
            max_body_size,
            error_pages,
            cgis: self.cgis,
            locations,
        })
    }
}

impl LocationFile {
    fn validate(self, i: usize, j: usize) -> WebservResult<Location> {
        let at = format!("hosts[{}].locations[{}]", i, j);

        if !self.path.starts_with('/') {
            return Err(invalid(format!("{}: path must start with '/'", at)));
        }

        let methods = match self.methods {
            Some(names) => names
                .iter()
                .map(|name| match name.to_ascii_uppercase().as_str() {
                    "GET" => Ok(Method::Get),
                    "POST" => Ok(Method::Post),
                    "DELETE" => Ok(Method::Delete),
                    _ => Err(invalid(format!("{}: unsupported method {:?}", at, name))),
                })
                .collect::<WebservResult<Vec<_>>>()?,
            None => vec![Method::Get],
        };

        let index = self.index.unwrap_or_else(|| "index.html".to_string());
        if !is_html(&index) {
            return Err(invalid(format!("{}: index must be .html or .htm", at)));
        }

        let cgi = self.cgi.unwrap_or_else(|| self.path.starts_with("/cgi-bin"));

        Ok(Location {
            path: self.path,
            root: self.root.unwrap_or_else(|| PathBuf::from("www")),
            methods,
            index,
            directory_listing: self.directory_listing,
            redirect: self.redirect,
            upload_path: self.upload_path,
            cgi,
        })
    }
}

fn is_html(name: &str) -> bool {
    name.ends_with(".html") || name.ends_with(".htm")
}

/// `10M` -> 10485760. Accepts `[1-9][0-9]*` followed by one of G, M, K, B.
pub fn parse_body_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if !s.is_ascii() {
        return None;
    }
    let (digits, unit) = s.split_at(s.len().checked_sub(1)?);
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let n: usize = digits.parse().ok()?;
    let mult: usize = match unit {
        "G" => 1 << 30,
        "M" => 1 << 20,
        "K" => 1 << 10,
        "B" => 1,
        _ => return None,
    };
    n.checked_mul(mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
max_connections = 64
client_timeout_secs = 15

[cgi.interpreters]
py = "/usr/bin/python3"
sh = "/bin/sh"

[[hosts]]
ip_address = "127.0.0.1"
port = 8080
server_name = "localhost"
client_max_body_size = "2K"
cgis = ["py", "sh"]

[hosts.error_pages]
"404" = "www/errors/404.html"

[[hosts.locations]]
path = "/"
root = "www"
methods = ["get", "POST"]

[[hosts.locations]]
path = "/cgi-bin"
root = "www/cgi-bin"
methods = ["GET", "POST"]

[[hosts]]
port = 8081
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.server.max_connections, 64);
        assert_eq!(cfg.server.client_timeout, Some(Duration::from_secs(15)));
        assert_eq!(cfg.hosts.len(), 2);

        let h = &cfg.hosts[0];
        assert_eq!(h.max_body_size, 2048);
        assert_eq!(h.error_pages[&404], PathBuf::from("www/errors/404.html"));
        assert_eq!(h.locations[0].methods, vec![Method::Get, Method::Post]);
        assert!(!h.locations[0].cgi);
        assert!(h.locations[1].cgi);
        assert_eq!(h.locations[0].index, "index.html");

        let second = &cfg.hosts[1];
        assert_eq!(second.ip_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(second.max_body_size, 100 << 20);
    }

    #[test]
    fn test_body_size_syntax() {
        assert_eq!(parse_body_size("1B"), Some(1));
        assert_eq!(parse_body_size("10K"), Some(10 * 1024));
        assert_eq!(parse_body_size("3G"), Some(3 << 30));
        assert_eq!(parse_body_size("0M"), None);
        assert_eq!(parse_body_size("10"), None);
        assert_eq!(parse_body_size("M"), None);
        assert_eq!(parse_body_size("1T"), None);
    }

    #[test]
    fn test_rejects_invalid_entries() {
        let cases = [
            "[[hosts]]\nserver_name = \"a\"",
            "[[hosts]]\nport = 70000",
            "[[hosts]]\nport = 80\ncgis = [\"rb\"]",
            "[[hosts]]\nport = 80\ncgis = [\"py\", \"py\"]",
            "[[hosts]]\nport = 80\n[hosts.error_pages]\n\"302\" = \"a.html\"",
            "[[hosts]]\nport = 80\n[hosts.error_pages]\n\"404\" = \"a.txt\"",
            "[[hosts]]\nport = 80\n[[hosts.locations]]\npath = \"nope\"",
            "[[hosts]]\nport = 80\n[[hosts.locations]]\npath = \"/\"\nmethods = [\"PUT\"]",
            "[[hosts]]\nport = 80\n[[hosts.locations]]\npath = \"/\"\nindex = \"a.php\"",
            "[[hosts]]\nport = 80\nserver_name = \"a\"\n[[hosts]]\nport = 80\nserver_name = \"a\"",
            "",
        ];
        for text in cases {
            assert!(
                matches!(Config::from_toml_str(text), Err(WebservError::Config(_))),
                "accepted: {text:?}"
            );
        }
        assert!(matches!(
            Config::from_toml_str("[[hosts]]\nport = 80\nbogus = 1"),
            Err(WebservError::Toml(_))
        ));
    }

    #[test]
    fn test_listener_groups_keep_order() {
        let text = r#"
[[hosts]]
port = 9000
server_name = "a"
[[hosts]]
port = 9001
server_name = "b"
[[hosts]]
port = 9000
server_name = "c"
"#;
        let cfg = Config::from_toml_str(text).unwrap();
        let groups = cfg.listener_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.port(), 9000);
        let names: Vec<_> = groups[0].1.iter().map(|h| h.server_name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(groups[1].1[0].server_name, "b");
    }
}
