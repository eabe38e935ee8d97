// src/multipart.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartError {
    /// A part has no closing boundary.
    Truncated,
    /// Part headers are not valid UTF-8 or have no terminating blank line.
    BadHeaders,
}

#[derive(Debug)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

/// Boundary parameter of a `multipart/form-data` content type.
pub fn boundary(content_type: &str) -> Option<&str> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.split(';').find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        if !k.eq_ignore_ascii_case("boundary") {
            return None;
        }
        let v = v.trim_matches('"');
        (!v.is_empty()).then_some(v)
    })
}

/// Iterates the parts of a multipart body.
pub struct Multipart<'a> {
    body: &'a [u8],
    boundary_marker: Vec<u8>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self {
            body,
            boundary_marker: marker,
        }
    }

    fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        data.windows(needle.len()).position(|w| w == needle)
    }

    fn fail(&mut self, err: MultipartError) -> Option<Result<Part<'a>, MultipartError>> {
        self.body = &[];
        Some(Err(err))
    }
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Result<Part<'a>, MultipartError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.body.is_empty() {
            return None;
        }

        let Some(mut start) = Self::find(self.body, &self.boundary_marker) else {
            self.body = &[];
            return None;
        };
        start += self.boundary_marker.len();

        // "--" after the boundary closes the body
        if self.body[start..].starts_with(b"--") {
            self.body = &[];
            return None;
        }
        if self.body[start..].starts_with(b"\r\n") {
            start += 2;
        }

        let Some(header_end) = Self::find(&self.body[start..], b"\r\n\r\n") else {
            return self.fail(MultipartError::BadHeaders);
        };
        let header_slice = &self.body[start..start + header_end];
        let body_start = start + header_end + 4;

        let Some(pos) = Self::find(&self.body[body_start..], &self.boundary_marker) else {
            return self.fail(MultipartError::Truncated);
        };
        let body_end = body_start + pos;
        // The CRLF before the next boundary belongs to the delimiter
        let content_end = if self.body[body_start..body_end].ends_with(b"\r\n") {
            body_end - 2
        } else {
            body_end
        };
        let body = &self.body[body_start..content_end];
        self.body = &self.body[body_end..];

        let Ok(headers) = std::str::from_utf8(header_slice) else {
            return self.fail(MultipartError::BadHeaders);
        };

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    match param.trim().split_once('=') {
                        Some(("name", v)) => name = Some(v.trim_matches('"')),
                        Some(("filename", v)) => filename = Some(v.trim_matches('"')),
                        _ => {}
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim());
            }
        }

        Some(Ok(Part {
            name,
            filename,
            content_type,
            body,
        }))
    }
}
