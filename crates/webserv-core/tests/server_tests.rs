use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use webserv_core::metrics::ReactorMetrics;
use webserv_core::{Config, Server, ShutdownHandle};

const CONFIG: &str = r#"
[server]
max_connections = 64

[cgi.interpreters]
sh = "/bin/sh"

[[hosts]]
ip_address = "127.0.0.1"
port = 8080
server_name = "localhost"
client_max_body_size = "1K"
cgis = ["sh"]

[hosts.error_pages]
"404" = "{root}/errors/404.html"

[[hosts.locations]]
path = "/"
root = "{root}"

[[hosts.locations]]
path = "/cgi-bin"
root = "{root}/cgi-bin"
methods = ["GET", "POST"]

[[hosts.locations]]
path = "/upload"
root = "{root}"
methods = ["POST"]
upload_path = "{root}/uploads"

[[hosts.locations]]
path = "/old"
redirect = "/index.html"

[[hosts]]
ip_address = "127.0.0.1"
port = 8080
server_name = "other.test"

[[hosts.locations]]
path = "/"
root = "{root}/other"
"#;

const INDEX: &str = "<html><body>hello world</body></html>";
const NOT_FOUND_PAGE: &str = "<h1>custom 404</h1>";

const ECHO_SCRIPT: &str = r#"body=$(cat)
printf 'Content-Type: text/plain\r\nX-Cgi: yes\r\n\r\n'
printf 'method=%s length=%s query=[%s] body=%s' "$REQUEST_METHOD" "$CONTENT_LENGTH" "$QUERY_STRING" "$body"
"#;

struct TestServer {
    addr: SocketAddr,
    root: PathBuf,
    handle: ShutdownHandle,
    metrics: Arc<ReactorMetrics>,
    thread: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(|_| {})
    }

    fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("www");
        fs::create_dir_all(root.join("errors")).unwrap();
        fs::create_dir_all(root.join("cgi-bin")).unwrap();
        fs::create_dir_all(root.join("other")).unwrap();
        fs::write(root.join("index.html"), INDEX).unwrap();
        fs::write(root.join("errors/404.html"), NOT_FOUND_PAGE).unwrap();
        fs::write(root.join("other/index.html"), "other host").unwrap();
        fs::write(root.join("cgi-bin/echo.sh"), ECHO_SCRIPT).unwrap();
        fs::write(
            root.join("cgi-bin/slow.sh"),
            "sleep 2\nbytes=$(wc -c)\nprintf 'Content-Type: text/plain\\n\\nread %s' \"$bytes\"\n",
        )
        .unwrap();
        fs::write(
            root.join("cgi-bin/hang.sh"),
            format!("echo $$ > {}\nexec sleep 30\n", root.join("hang.pid").display()),
        )
        .unwrap();

        let text = CONFIG.replace("{root}", &root.display().to_string());
        let mut config = Config::from_toml_str(&text).unwrap();
        for host in &mut config.hosts {
            host.port = 0;
        }
        adjust(&mut config);

        let server = Server::bind(config).unwrap();
        let addr = server.local_addrs()[0];
        let handle = server.shutdown_handle();
        let metrics = server.metrics();
        let thread = thread::spawn(move || server.run().unwrap());

        Self {
            addr,
            root,
            handle,
            metrics,
            thread: Some(thread),
            _dir: dir,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn send(&self, raw: &[u8]) -> String {
        let mut stream = self.connect();
        stream.write_all(raw).unwrap();
        read_all(&mut stream)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn read_all(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn body(res: &str) -> &str {
    res.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_get_static_file() {
    let server = TestServer::start();
    let res = server.send(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.contains("Content-Type: text/html; charset=UTF-8\r\n"));
    assert!(res.contains("Content-Length: 37\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    assert!(res.contains("Server: webserv\r\n"));
    assert!(res.contains("Set-Cookie: session_id="));
    assert_eq!(body(&res), INDEX);
}

#[test]
fn test_directory_serves_index() {
    let server = TestServer::start();
    let res = server.send(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body(&res), INDEX);
}

#[test]
fn test_missing_file_uses_error_page() {
    let server = TestServer::start();
    let res = server.send(b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "{res}");
    assert_eq!(body(&res), NOT_FOUND_PAGE);
}

#[test]
fn test_host_without_error_page_gets_generated_page() {
    let server = TestServer::start();
    // other.test only has "/" backed by its own root
    let res = server.send(b"GET /index.html HTTP/1.1\r\nHost: other.test\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
    // No custom page on this host: generated body
    assert!(body(&res).contains("404 Not Found"));
}

#[test]
fn test_virtual_host_by_name() {
    let server = TestServer::start();
    let res = server.send(b"GET / HTTP/1.1\r\nHost: other.test:8080\r\n\r\n");
    assert_eq!(body(&res), "other host");
    let res = server.send(b"GET / HTTP/1.1\r\nHost: unknown.test\r\n\r\n");
    assert_eq!(body(&res), INDEX);
}

#[test]
fn test_method_not_allowed() {
    let server = TestServer::start();
    let res = server.send(b"DELETE /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{res}");
    assert!(res.contains("Allow: GET\r\n"));
    assert!(server.root.join("index.html").exists());
}

#[test]
fn test_declared_body_over_limit() {
    let server = TestServer::start();
    let res = server.send(b"POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5000\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"), "{res}");
    assert!(!server.root.join("uploads").exists());
}

#[test]
fn test_unrepresentable_length_is_413() {
    let server = TestServer::start();
    let res = server.send(
        b"POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 99999999999999999999999\r\n\r\n",
    );
    assert!(res.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"), "{res}");
}

#[test]
fn test_malformed_request() {
    let server = TestServer::start();
    let res = server.send(b"this is not http\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    let res = server.send(b"POST /upload HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_truncated_request_is_400() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.write_all(b"GET /index.html HTTP/1.1\r\nHost: loc").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let res = read_all(&mut stream);
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{res}");
}

#[test]
fn test_empty_connection_gets_no_response() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    assert_eq!(read_all(&mut stream), "");

    // Other clients are unaffected
    let res = server.send(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_request_split_across_writes() {
    let server = TestServer::start();
    let mut stream = server.connect();
    for piece in [&b"GET /ind"[..], b"ex.html HTTP/1.1\r\nHo", b"st: localhost\r\n", b"\r\n"] {
        stream.write_all(piece).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
    }
    let res = read_all(&mut stream);
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body(&res), INDEX);
}

#[test]
fn test_redirect() {
    let server = TestServer::start();
    let res = server.send(b"GET /old/page HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 307 Temporary Redirect\r\n"));
    assert!(res.contains("Location: /index.html\r\n"));
    assert!(res.contains("Content-Length: 0\r\n"));
}

#[test]
fn test_upload_stores_body() {
    let server = TestServer::start();
    let res = server.send(b"POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9\r\n\r\nsome data");
    assert!(res.starts_with("HTTP/1.1 201 Created\r\n"), "{res}");

    let stored: Vec<_> = fs::read_dir(server.root.join("uploads"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(stored.len(), 1);
    assert_eq!(fs::read(&stored[0]).unwrap(), b"some data");
}

#[test]
fn test_cgi_post_echo() {
    let server = TestServer::start();
    let res = server.send(b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3\r\n\r\na=1");

    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.contains("Content-Type: text/plain\r\n"));
    assert!(res.contains("X-Cgi: yes\r\n"));
    assert_eq!(body(&res), "method=POST length=3 query=[] body=a=1");
    assert_eq!(server.metrics.snapshot().cgi_runs, 1);
}

#[test]
fn test_cgi_get_with_query() {
    let server = TestServer::start();
    let res = server.send(b"GET /cgi-bin/echo.sh?x=1&y=2 HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(body(&res), "method=GET length= query=[x=1&y=2] body=");
}

#[test]
fn test_cgi_missing_script() {
    let server = TestServer::start();
    let res = server.send(b"GET /cgi-bin/nope.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn test_abandoned_cgi_child_is_killed() {
    let server = TestServer::start();
    let pid_file = server.root.join("hang.pid");

    let mut stream = server.connect();
    stream
        .write_all(b"GET /cgi-bin/hang.sh HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    wait_for("cgi child to start", || {
        fs::read_to_string(&pid_file).is_ok_and(|s| s.trim().parse::<u32>().is_ok())
    });
    let pid: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(proc_exists(pid));

    reset(stream);
    wait_for("cgi child to be killed and reaped", || !proc_exists(pid));
}

fn proc_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

/// Close with SO_LINGER 0 so the server sees a reset instead of a FIN.
fn reset(stream: TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
    drop(stream);
}

#[test]
fn test_half_closed_client_still_gets_cgi_response() {
    let server = TestServer::start();
    let mut stream = server.connect();
    stream
        .write_all(b"GET /cgi-bin/echo.sh?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let res = read_all(&mut stream);
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert_eq!(body(&res), "method=GET length= query=[x=1] body=");
}

#[test]
fn test_slow_cgi_input_does_not_block_other_clients() {
    let server = TestServer::start_with(|config| {
        config.hosts[0].max_body_size = 1024 * 1024;
    });
    let addr = server.addr;
    let size = 200_000;

    let uploader = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let head = format!(
            "POST /cgi-bin/slow.sh HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            size
        );
        stream.write_all(head.as_bytes()).unwrap();
        stream.write_all(&vec![b'x'; size]).unwrap();
        read_all(&mut stream)
    });

    wait_for("cgi child to start", || server.metrics.snapshot().cgi_runs == 1);
    let started = Instant::now();
    let res = server.send(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "static request waited {:?} behind a cgi body",
        started.elapsed()
    );

    // The whole body still reaches the script once it starts reading
    let res = uploader.join().unwrap();
    assert_eq!(body(&res), format!("read {}", size));
}

#[test]
fn test_oversized_body_never_reaches_cgi() {
    let server = TestServer::start();
    let res = server.send(b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5000\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"), "{res}");
    assert_eq!(server.metrics.snapshot().cgi_runs, 0);
}

#[test]
fn test_disallowed_method_touches_nothing() {
    let server = TestServer::start();
    let script = server.root.join("cgi-bin/echo.sh");

    let res = server.send(b"DELETE /cgi-bin/echo.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{res}");
    assert!(res.contains("Allow: GET, POST\r\n"));
    assert!(script.exists());
    assert_eq!(server.metrics.snapshot().cgi_runs, 0);
}

#[test]
fn test_known_session_keeps_cookie() {
    let server = TestServer::start();
    let res = server.send(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    let cookie = res
        .lines()
        .find_map(|l| l.strip_prefix("Set-Cookie: "))
        .and_then(|c| c.split(';').next())
        .unwrap()
        .to_string();

    let req = format!("GET / HTTP/1.1\r\nHost: localhost\r\nCookie: {}\r\n\r\n", cookie);
    let res = server.send(req.as_bytes());
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!res.contains("Set-Cookie"));
}

#[test]
fn test_concurrent_clients() {
    let server = TestServer::start();
    let addr = server.addr;
    let workers: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                stream
                    .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
                    .unwrap();
                read_all(&mut stream)
            })
        })
        .collect();
    for worker in workers {
        let res = worker.join().unwrap();
        assert_eq!(body(&res), INDEX);
    }
    wait_for("every connection to be released", || {
        server.metrics.snapshot().active_conns == 0
    });
    let m = server.metrics.snapshot();
    assert_eq!(m.accepted, 8);
    assert_eq!(m.responses, 8);
    assert_eq!(m.teardowns, 8);
    assert_eq!(m.rejected, 0);
}

#[test]
fn test_idle_client_is_dropped() {
    let server = TestServer::start_with(|config| {
        config.server.client_timeout = Some(Duration::from_secs(1));
    });
    let mut stream = server.connect();
    stream.write_all(b"GET /index.html HTTP/1.1\r\n").unwrap();

    let started = Instant::now();
    assert_eq!(read_all(&mut stream), "");
    assert!(started.elapsed() >= Duration::from_millis(900));
}
