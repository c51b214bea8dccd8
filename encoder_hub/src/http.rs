//! Minimal HTTP/1.1 plumbing shared by the streaming and control servers.
//! Both serve a handful of local clients; requests are parsed off the
//! socket directly, responses are written back with explicit headers.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;

/// Request bodies above this are rejected outright.
const MAX_BODY: usize = 1024 * 1024;
const MAX_HEADER_LINES: usize = 100;

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    /// Form-encoded body fields.
    pub fn form(&self) -> HashMap<String, String> {
        parse_query(&String::from_utf8_lossy(&self.body))
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Form or JSON body, whichever parses; endpoints accept both.
    pub fn body_fields(&self) -> HashMap<String, String> {
        if let Some(serde_json::Value::Object(map)) = self.json() {
            let mut out = HashMap::new();
            for (k, v) in map {
                let s = match v {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Bool(b) => b.to_string(),
                    serde_json::Value::Number(n) => n.to_string(),
                    _ => continue,
                };
                out.insert(k, s);
            }
            out
        } else {
            self.form()
        }
    }
}

pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(v);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn parse_query(q: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in q.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        out.insert(url_decode(k), url_decode(v));
    }
    out
}

/// Reads one request: request line, headers, and a Content-Length body.
pub fn read_request(stream: &mut TcpStream) -> io::Result<Request> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty request line"))?
        .to_ascii_uppercase();
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing request target"))?;

    let (raw_path, raw_query) = target.split_once('?').unwrap_or((target, ""));
    let path = url_decode(raw_path);
    let query = parse_query(raw_query);

    let mut headers = HashMap::new();
    for _ in 0..MAX_HEADER_LINES {
        let mut hline = String::new();
        reader.read_line(&mut hline)?;
        let trimmed = hline.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "body too large"));
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body)?;
    }

    Ok(Request {
        method,
        path,
        query,
        headers,
        body,
    })
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        302 => "Found",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub fn respond(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_text(status),
        content_type,
        body.len()
    )?;
    stream.write_all(body)?;
    stream.flush()
}

/// Same headers as a GET, no body.
pub fn respond_head(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    length: usize,
) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_text(status),
        content_type,
        length
    )?;
    stream.flush()
}

pub fn respond_json(
    stream: &mut TcpStream,
    status: u16,
    value: &serde_json::Value,
) -> io::Result<()> {
    respond(stream, status, "application/json", value.to_string().as_bytes())
}

pub fn respond_error(stream: &mut TcpStream, status: u16, message: &str) -> io::Result<()> {
    respond_json(stream, status, &serde_json::json!({ "error": message }))
}

pub fn respond_redirect(stream: &mut TcpStream, location: &str) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        location
    )?;
    stream.flush()
}

/// `bytes=a-b` / `bytes=a-` / `bytes=-n` against a resource of `len` bytes.
/// Returns the inclusive byte range.
pub fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_s, end_s) = spec.split_once('-')?;
    if len == 0 {
        return None;
    }
    if start_s.is_empty() {
        // Suffix form: last n bytes.
        let n: u64 = end_s.parse().ok()?;
        if n == 0 {
            return None;
        }
        let n = n.min(len);
        return Some((len - n, len - 1));
    }
    let start: u64 = start_s.parse().ok()?;
    if start >= len {
        return None;
    }
    let end = if end_s.is_empty() {
        len - 1
    } else {
        end_s.parse::<u64>().ok()?.min(len - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

/// Characters that may never appear in externally supplied path input.
const FORBIDDEN: &[char] = &['\'', '"', ';', '$', '|', '&', '\n', '\r', ' '];

/// A bare filename: no traversal, no separators, no shell metacharacters.
pub fn sanitize_filename(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("empty name".to_string());
    }
    if name.contains("..") {
        return Err("path traversal rejected".to_string());
    }
    if name.contains('/') || name.contains('\\') {
        return Err("separators rejected in filename".to_string());
    }
    if name.contains(FORBIDDEN) {
        return Err("forbidden character in name".to_string());
    }
    Ok(name)
}

/// A relative browse path: separators allowed, everything else as above.
pub fn sanitize_relpath(path: &str) -> Result<&str, String> {
    if path.contains("..") {
        return Err("path traversal rejected".to_string());
    }
    if path.contains(FORBIDDEN) {
        return Err("forbidden character in path".to_string());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_and_decode() {
        let q = parse_query("a=1&b=hello%20world&c=x%2By&flag");
        assert_eq!(q.get("a").unwrap(), "1");
        assert_eq!(q.get("b").unwrap(), "hello world");
        assert_eq!(q.get("c").unwrap(), "x+y");
        assert_eq!(q.get("flag").unwrap(), "");
        assert_eq!(url_decode("a+b"), "a b");
    }

    #[test]
    fn range_forms() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=0-5000", 1000), Some((0, 999)));
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=9-5", 1000), None);
        assert_eq!(parse_range("lines=0-5", 1000), None);
    }

    #[test]
    fn filename_sanitizer_rejects_attacks() {
        assert!(sanitize_filename("ok_file-01.mp4").is_ok());
        for bad in [
            "../etc/passwd",
            "a/b.mp4",
            "a\\b.mp4",
            "x;rm",
            "x|y",
            "x&y",
            "x$y",
            "x'y",
            "x\"y",
            "x\ny",
            "x\ry",
            "with space.mp4",
            "",
        ] {
            assert!(sanitize_filename(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn relpath_allows_separators_only() {
        assert!(sanitize_relpath("sub/dir").is_ok());
        assert!(sanitize_relpath("sub/../up").is_err());
        assert!(sanitize_relpath("a;b/c").is_err());
    }

    #[test]
    fn status_lines() {
        assert_eq!(status_text(206), "Partial Content");
        assert_eq!(status_text(404), "Not Found");
    }
}
