//! Minimal HTTP/1.1 request-head parser for the upgrade exchange.
//!
//! Only the request line and headers are parsed; any bytes after the blank
//! line belong to the WebSocket stream and are left in the caller's buffer.

use std::str;

/// Parsed HTTP request head
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True if the client asked to switch to the WebSocket protocol.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("Upgrade")
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
            })
            .unwrap_or(false)
    }
}

/// HTTP parse errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The request head exceeds the configured limit.
    HeaderTooLarge,
    /// The request head is not valid HTTP/1.x.
    Malformed(&'static str),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::HeaderTooLarge => write!(f, "request header too large"),
            HttpError::Malformed(reason) => write!(f, "malformed request: {reason}"),
        }
    }
}

impl std::error::Error for HttpError {}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Request head with bytes consumed (including the blank line)
    Complete(Request, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(HttpError),
}

/// Parse a request head from `buffer`, rejecting heads longer than `max_size`.
pub fn parse_request(buffer: &[u8], max_size: usize) -> ParseResult {
    let end = match find_head_end(buffer) {
        Some(pos) => pos,
        None if buffer.len() > max_size => return ParseResult::Error(HttpError::HeaderTooLarge),
        None => return ParseResult::Incomplete,
    };

    let consumed = end + 4;
    if consumed > max_size {
        return ParseResult::Error(HttpError::HeaderTooLarge);
    }

    let head = match str::from_utf8(&buffer[..end]) {
        Ok(s) => s,
        Err(_) => return ParseResult::Error(HttpError::Malformed("invalid UTF-8")),
    };

    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) => (m, p, v),
        _ => return ParseResult::Error(HttpError::Malformed("invalid request line")),
    };

    if !version.starts_with("HTTP/1.") {
        return ParseResult::Error(HttpError::Malformed("unsupported HTTP version"));
    }

    let mut headers = Vec::new();
    for line in lines {
        match line.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            _ => return ParseResult::Error(HttpError::Malformed("invalid header line")),
        }
    }

    ParseResult::Complete(
        Request {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
        },
        consumed,
    )
}

/// Find `\r\n\r\n`, returning the position of the first `\r`.
fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// `200 OK` with a plain-text body; the connection is closed afterwards.
pub fn ok_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
}

/// `400 Bad Request` with the reason as the body.
pub fn bad_request(reason: &str) -> String {
    let body = format!("Bad Request: {reason}");
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
}
