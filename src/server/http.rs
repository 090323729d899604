use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str;
use tracing::debug;
use super::response::{send_error_response, ErrorHook};

/// Classification of a received line by its leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Get,
    Put,
    Patch,
    Delete,
    Post,
    ContentLength,
    Host,
    Other
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Patch,
    Delete,
    Post
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Post => "POST"
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LineTag {
    /// The request method for method tags, `None` for header and unknown tags.
    pub fn method(self) -> Option<Method> {
        match self {
            LineTag::Get => Some(Method::Get),
            LineTag::Put => Some(Method::Put),
            LineTag::Patch => Some(Method::Patch),
            LineTag::Delete => Some(Method::Delete),
            LineTag::Post => Some(Method::Post),
            LineTag::ContentLength | LineTag::Host | LineTag::Other => None
        }
    }
}

const CONTENT_LENGTH_PREFIX: &[u8] = b"Content-Length:";

const METHOD_PREFIXES: [(&[u8], LineTag); 5] = [
    (b"GET ", LineTag::Get),
    (b"PUT ", LineTag::Put),
    (b"PATCH ", LineTag::Patch),
    (b"DELETE ", LineTag::Delete),
    (b"POST ", LineTag::Post)
];

const HEADER_PREFIXES: [(&[u8], LineTag); 2] = [
    (CONTENT_LENGTH_PREFIX, LineTag::ContentLength),
    (b"Host:", LineTag::Host)
];

/// Prefix match of `line` against the known tags. Methods match exactly,
/// header names ignore ASCII case.
pub fn classify(line: &[u8]) -> LineTag {
    METHOD_PREFIXES.iter()
        .find(|(prefix, _)| line.starts_with(prefix))
        .or_else(|| HEADER_PREFIXES.iter().find(|(prefix, _)| starts_with_ignore_case(line, prefix)))
        .map(|(_, tag)| *tag)
        .unwrap_or(LineTag::Other)
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    EndOfHeader,
    LineReceived,
    Error
}

/// Reads one CRLF-terminated line into `line`, terminator included.
///
/// A line that is exactly CRLF yields `EndOfHeader`. Overflowing `capacity`
/// answers 413 and a failed read answers 400 before returning `Error`; an
/// orderly close returns `Error` silently.
pub fn receive_line<S: Read + Write>(stream: &mut S, line: &mut Vec<u8>, capacity: usize, hook: Option<&dyn ErrorHook>) -> LineStatus {
    line.clear();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                debug!("connection closed by peer");
                return LineStatus::Error;
            },
            Ok(_) => {},
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("error receiving line:{}", e);
                let _ = send_error_response(stream, 400, hook);
                return LineStatus::Error;
            }
        }
        if line.len() >= capacity {
            debug!(capacity, "line exceeds capacity");
            let _ = send_error_response(stream, 413, hook);
            return LineStatus::Error;
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            return if line.len() == 2 { LineStatus::EndOfHeader } else { LineStatus::LineReceived };
        }
    }
}

/// Decimal value following `Content-Length:`; missing or malformed digits count as 0.
pub fn parse_content_length(line: &[u8]) -> usize {
    let value = if starts_with_ignore_case(line, CONTENT_LENGTH_PREFIX) {
        &line[CONTENT_LENGTH_PREFIX.len()..]
    } else {
        line
    };
    value.iter()
        .skip_while(|b| **b == b' ' || **b == b'\t')
        .take_while(|b| b.is_ascii_digit())
        .fold(0usize, |acc, b| acc.saturating_mul(10).saturating_add((b - b'0') as usize))
}

#[derive(Debug, PartialEq, Eq)]
pub struct BadRequest {
    pub status: u16,
    pub reason: &'static str
}

#[derive(Debug, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: Method,
    pub uri: &'a str
}

/// Splits `METHOD SP URI SP VERSION` and validates the method and URI length.
pub fn parse_request_line(line: &[u8], max_uri_len: usize) -> Result<RequestLine<'_>, BadRequest> {
    let method = match classify(line).method() {
        Some(method) => method,
        None => return Err(BadRequest { status: 400, reason: "Method not recognized" })
    };
    let uri_start = match line.iter().position(|b| *b == b' ') {
        Some(index) => index + 1,
        None => return Err(BadRequest { status: 400, reason: "No URI" })
    };
    let uri_len = match line[uri_start..].iter().position(|b| *b == b' ') {
        Some(0) | None => return Err(BadRequest { status: 400, reason: "No URI" }),
        Some(len) => len
    };
    if uri_len > max_uri_len {
        return Err(BadRequest { status: 413, reason: "URI too long" });
    }
    match str::from_utf8(&line[uri_start..uri_start + uri_len]) {
        Ok(uri) => Ok(RequestLine { method, uri }),
        Err(_) => Err(BadRequest { status: 400, reason: "URI not understood" })
    }
}

/// Splits a URI at the first `?` into path and query arguments.
pub fn split_query(uri: &str) -> (&str, Option<&str>) {
    match uri.find('?') {
        Some(index) => (&uri[..index], Some(&uri[index + 1..])),
        None => (uri, None)
    }
}
