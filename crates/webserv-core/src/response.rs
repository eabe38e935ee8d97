// src/response.rs
use crate::config::VirtualHost;
use std::io;
use std::path::Path;
use std::time::SystemTime;
use tracing::warn;

pub const SERVER_NAME: &str = "webserv";

const HTML: &str = "text/html; charset=UTF-8";
const DEFAULT_MIME: &str = "application/octet-stream";

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Content type for a file, by extension. Unknown extensions are served as
/// `application/octet-stream`.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html") | Some("htm") => HTML,
        Some("css") => "text/css; charset=UTF-8",
        Some("js") => "application/javascript; charset=UTF-8",
        Some("ttf") => "font/ttf",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("bmp") => "image/bmp",
        Some("tiff") => "image/tiff",
        Some("webp") => "image/webp",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("txt") => "text/plain; charset=UTF-8",
        Some("sitemap") | Some("xml") => "application/xml; charset=UTF-8",
        Some("json") => "application/json; charset=UTF-8",
        Some("csv") => "text/csv; charset=UTF-8",
        Some("markdown") | Some("md") => "text/markdown; charset=UTF-8",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gzip") | Some("gz") => "application/gzip",
        _ => DEFAULT_MIME,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: Option<String>,
    /// Extra headers, written after the fixed ones in insertion order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn html(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: Some(HTML.to_string()),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(key, value);
        self
    }

    /// Replace an existing header of the same name, or append.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The file's bytes with a content type inferred from its extension.
    pub fn from_file(status: u16, path: &Path) -> io::Result<Self> {
        let body = std::fs::read(path)?;
        Ok(Self {
            status,
            content_type: Some(mime_type(path).to_string()),
            headers: Vec::new(),
            body,
        })
    }

    pub fn redirect(location: &str) -> Self {
        Self::new(307).header("Location", location)
    }

    /// Error page for `status`: the host's configured page when it can be
    /// read, a generated page otherwise.
    pub fn error_page(status: u16, host: Option<&VirtualHost>) -> Self {
        if let Some(page) = host.and_then(|h| h.error_pages.get(&status)) {
            match Self::from_file(status, page) {
                Ok(res) => return res,
                Err(e) => warn!(status, page = %page.display(), error = %e, "error page unreadable"),
            }
        }
        Self::html(status, default_error_body(status))
    }

    /// Wire bytes stamped with the current time.
    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_at(SystemTime::now())
    }

    /// Status line, `Date`, `Server`, `Connection: close`, `Content-Length`,
    /// optional `Content-Type`, extra headers, blank line, body.
    pub fn serialize_at(&self, now: SystemTime) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nDate: {}\r\nServer: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
            self.status,
            reason_phrase(self.status),
            httpdate::fmt_http_date(now),
            SERVER_NAME,
            self.body.len()
        );
        if let Some(ct) = &self.content_type {
            head.push_str("Content-Type: ");
            head.push_str(ct);
            head.push_str("\r\n");
        }
        for (k, v) in &self.headers {
            head.push_str(k);
            head.push_str(": ");
            head.push_str(v);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn default_error_body(status: u16) -> String {
    let title = format!("{} {}", status, reason_phrase(status));
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n<title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n<hr>\n<p>{SERVER_NAME}</p>\n</body>\n</html>\n"
    )
}
