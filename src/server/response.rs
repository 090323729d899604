use std::io::{self, Write};
use http::StatusCode;

pub const FALLBACK_REASON: &str = "Unknown";

/// Application hook consulted before the server synthesizes an error response.
///
/// Returning `true` means the hook already wrote a complete response for
/// `status` and nothing more is sent.
pub trait ErrorHook: Send + Sync {
    fn send_error(&self, writer: &mut dyn Write, status: u16) -> bool;
}

impl<F> ErrorHook for F where F: Fn(&mut dyn Write, u16) -> bool + Send + Sync {
    fn send_error(&self, writer: &mut dyn Write, status: u16) -> bool {
        self(writer, status)
    }
}

/// Status codes are written as three digits.
fn clamp_status(status: u16) -> u16 {
    status.clamp(100, 999)
}

pub fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(clamp_status(status))
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or(FALLBACK_REASON)
}

fn write_status_line(head: &mut Vec<u8>, status: u16) -> io::Result<()> {
    let status = clamp_status(status);
    write!(head, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status))
}

fn write_length(head: &mut Vec<u8>, status: u16, length: usize) -> io::Result<()> {
    if status != 204 {
        write!(head, "Content-Length:{}\r\n", length)?;
    }
    head.extend_from_slice(b"\r\n");
    Ok(())
}

pub fn send_status_line<W: Write + ?Sized>(writer: &mut W, status: u16) -> io::Result<()> {
    let mut head = Vec::with_capacity(32);
    write_status_line(&mut head, status)?;
    writer.write_all(&head)
}

/// Writes a complete response head followed by `body`.
///
/// `length` is announced as Content-Length (never for 204) and may exceed
/// `body.len()` when the caller streams the remainder itself.
pub fn send_simple_response<W: Write + ?Sized>(writer: &mut W, status: u16, content_type: Option<&str>, length: usize, body: &[u8]) -> io::Result<()> {
    let mut head = Vec::with_capacity(128);
    write_status_line(&mut head, status)?;
    if let Some(content_type) = content_type {
        write!(head, "Content-Type:{}\r\n", content_type)?;
    }
    write_length(&mut head, status, length)?;
    writer.write_all(&head)?;
    if !body.is_empty() {
        writer.write_all(body)?;
    }
    writer.flush()
}

/// Like [`send_simple_response`] with caller-formatted header lines, given
/// without their CRLF.
pub fn send_response<W: Write + ?Sized>(writer: &mut W, status: u16, header_lines: &[&str], length: usize, body: &[u8]) -> io::Result<()> {
    let mut head = Vec::with_capacity(128);
    write_status_line(&mut head, status)?;
    for line in header_lines {
        head.extend_from_slice(line.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    write_length(&mut head, status, length)?;
    writer.write_all(&head)?;
    if !body.is_empty() {
        writer.write_all(body)?;
    }
    writer.flush()
}

pub fn send_error_response<W: Write>(writer: &mut W, status: u16, hook: Option<&dyn ErrorHook>) -> io::Result<()> {
    if let Some(hook) = hook {
        if hook.send_error(writer, status) {
            return Ok(());
        }
    }
    let status = clamp_status(status);
    let body = format!("Failed: {} {}", status, reason_phrase(status));
    send_simple_response(writer, status, Some("text/plain"), body.len(), body.as_bytes())
}

pub fn send_response_chunked<W: Write + ?Sized>(writer: &mut W, status: u16, content_type: Option<&str>) -> io::Result<()> {
    let mut head = Vec::with_capacity(128);
    write_status_line(&mut head, status)?;
    if let Some(content_type) = content_type {
        write!(head, "Content-Type:{}\r\n", content_type)?;
    }
    head.extend_from_slice(b"Transfer-Encoding:chunked\r\n\r\n");
    writer.write_all(&head)
}

/// Writes one chunk; an empty `chunk` writes the terminating zero-size chunk.
pub fn send_chunk<W: Write + ?Sized>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    if chunk.is_empty() {
        writer.write_all(b"0\r\n\r\n")?;
        return writer.flush();
    }
    let mut framed = Vec::with_capacity(chunk.len() + 12);
    write!(framed, "{:x}\r\n", chunk.len())?;
    framed.extend_from_slice(chunk);
    framed.extend_from_slice(b"\r\n");
    writer.write_all(&framed)
}
