//! Parsed message heads and header-block formatting.

use std::fmt::Write as _;

/// First line plus headers of one message.
///
/// For a request `line` is `[method, target, version]`, for a response
/// `[version, status, reason]`. Versions are in short form (`1.1`), header
/// keys are lower case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHead {
    pub line: [String; 3],
    pub headers: Vec<(String, String)>,
}

impl MessageHead {
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        let mut it = tokens.into_iter();
        let line = [
            it.next().unwrap_or_default(),
            it.next().unwrap_or_default(),
            it.next().unwrap_or_default(),
        ];
        let mut headers = Vec::new();
        while let Some(key) = it.next() {
            headers.push((key, it.next().unwrap_or_default()));
        }
        MessageHead { line, headers }
    }

    pub fn method(&self) -> &str {
        &self.line[0]
    }

    pub fn target(&self) -> &str {
        &self.line[1]
    }

    pub fn status(&self) -> Option<u16> {
        self.line[1].parse().ok()
    }

    pub fn reason(&self) -> &str {
        &self.line[2]
    }

    /// `1.0`, `1.1`: the request's third part or the response's first.
    pub fn version(&self, request: bool) -> &str {
        if request {
            &self.line[2]
        } else {
            &self.line[0]
        }
    }

    /// First value of `key` (lower case).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the peer allows the connection to be reused.
    pub fn keep_alive(&self, request: bool) -> bool {
        let conn = self.header("connection").map(|v| v.to_ascii_lowercase());
        match conn.as_deref() {
            Some(v) if v.contains("close") => false,
            Some(v) if v.contains("keep-alive") => true,
            _ => self.version(request) != "1.0",
        }
    }
}

/// Build a header block: first line, headers, blank line.
pub fn format_head(first_line: &str, headers: &[(&str, String)]) -> Vec<u8> {
    let mut out = String::with_capacity(128);
    out.push_str(first_line);
    out.push_str("\r\n");
    for (k, v) in headers {
        let _ = write!(out, "{}: {}\r\n", k, v);
    }
    out.push_str("\r\n");
    out.into_bytes()
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
