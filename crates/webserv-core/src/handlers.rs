// src/handlers.rs
//! Synchronous local handlers: static files, directory listings, redirects,
//! uploads and deletes. Each returns the finished response or the status to
//! answer with.

use crate::config::Location;
use crate::error::ResponseError;
use crate::http::{Method, Request};
use crate::listener::Route;
use crate::multipart::{self, Multipart};
use crate::response::Response;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Answer a non-CGI request on an already resolved route.
pub fn handle(route: &Route<'_>, request: &Request) -> Result<Response, ResponseError> {
    let location = route.location;
    if let Some(target) = &location.redirect {
        return Ok(Response::redirect(target));
    }

    match request.method() {
        Method::Get => {
            let path = resolve_path(location, request.path())?;
            serve(location, &path, request.path())
        }
        Method::Post => match &location.upload_path {
            Some(dir) => upload(dir, request),
            None => Err(ResponseError::new(403)),
        },
        Method::Delete => {
            let path = resolve_path(location, request.path())?;
            delete(&path)
        }
        _ => Err(ResponseError::new(405).with_header("Allow", location.allow_header())),
    }
}

/// Filesystem path for a request: the location root joined with the request
/// path minus the location prefix. `..` segments are refused.
pub fn resolve_path(location: &Location, url_path: &str) -> Result<PathBuf, ResponseError> {
    let decoded = percent_decode(url_path).ok_or_else(|| ResponseError::new(400))?;
    let rest = decoded
        .strip_prefix(location.path.as_str())
        .unwrap_or(&decoded);

    let mut path = location.root.clone();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(ResponseError::new(403)),
            s => path.push(s),
        }
    }
    Ok(path)
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let decoded = String::from_utf8(out).ok()?;
    // An encoded NUL would truncate the path at the syscall boundary
    (!decoded.contains('\0')).then_some(decoded)
}

fn serve(location: &Location, path: &Path, url_path: &str) -> Result<Response, ResponseError> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(Response::from_file(200, path)?);
    }

    let index = path.join(&location.index);
    if index.is_file() {
        return Ok(Response::from_file(200, &index)?);
    }
    if location.directory_listing {
        return Ok(directory_listing(path, url_path)?);
    }
    Err(ResponseError::new(403))
}

/// HTML index of a directory, entries sorted by name, subdirectories marked
/// with a trailing slash.
pub fn directory_listing(dir: &Path, url_path: &str) -> std::io::Result<Response> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let base = url_path.trim_end_matches('/');
    let title = escape_html(if url_path.is_empty() { "/" } else { url_path });
    let mut html = format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n<title>Index of {title}</title>\n</head>\n<body>\n<h1>Index of {title}</h1>\n<hr>\n<ul>\n"
    );
    if !base.is_empty() {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for name in &names {
        let name = escape_html(name);
        html.push_str(&format!("<li><a href=\"{base}/{name}\">{name}</a></li>\n"));
    }
    html.push_str("</ul>\n</body>\n</html>\n");

    Ok(Response::html(200, html))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Store a POST body under `dir`. Multipart file parts are saved under their
/// sanitized names; any other body becomes `upload-<unix millis>.bin`.
pub fn upload(dir: &Path, request: &Request) -> Result<Response, ResponseError> {
    fs::create_dir_all(dir).map_err(|e| {
        warn!(dir = %dir.display(), error = %e, "upload directory unavailable");
        ResponseError::new(500)
    })?;

    let mut saved = Vec::new();
    match request.header("content-type").and_then(multipart::boundary) {
        Some(boundary) => {
            for part in Multipart::new(&request.body, boundary) {
                let part = part.map_err(|_| ResponseError::new(400))?;
                let Some(name) = part.filename.and_then(sanitize_filename) else {
                    continue;
                };
                fs::write(dir.join(&name), part.body)?;
                saved.push(name);
            }
            if saved.is_empty() {
                return Err(ResponseError::new(400));
            }
        }
        None => {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let name = format!("upload-{}.bin", millis);
            fs::write(dir.join(&name), &request.body)?;
            saved.push(name);
        }
    }
    debug!(dir = %dir.display(), files = ?saved, "upload stored");

    let mut html = String::from(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n<title>201 Created</title>\n</head>\n<body>\n<h1>Uploaded</h1>\n<ul>\n",
    );
    for name in &saved {
        html.push_str(&format!("<li>{}</li>\n", escape_html(name)));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    Ok(Response::html(201, html))
}

/// Base name of a client-supplied filename, restricted to a safe alphabet.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Remove one regular file. Directories are refused.
pub fn delete(path: &Path) -> Result<Response, ResponseError> {
    if fs::metadata(path)?.is_dir() {
        return Err(ResponseError::new(403));
    }
    fs::remove_file(path)?;
    debug!(path = %path.display(), "file deleted");
    Ok(Response::html(
        200,
        "<!DOCTYPE html>\n<html lang=\"en\">\n<body>\n<h1>Deleted</h1>\n</body>\n</html>\n",
    ))
}
