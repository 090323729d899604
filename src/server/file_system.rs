use std::fs::{metadata, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tracing::debug;
use super::connection::Connection;
use super::http::Method;
use super::response::send_response;
use super::session::SessionContext;
use super::url_handler::{HandlerOutcome, Request, UrlHandler, UrlHandlerFactory};

const INDEX_FILE: &str = "index.html";
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Serves GET requests for files under a root directory.
///
/// A `.gz` sibling is served instead when the client sent
/// `Accept-Encoding: gzip`, and `If-Modified-Since` is answered with 304.
/// Unknown paths are left to the next handler.
pub struct FileSystemHandler {
    root: Arc<PathBuf>
}

impl FileSystemHandler {
    pub fn new(root: &Path) -> FileSystemHandler {
        FileSystemHandler {
            root: Arc::new(root.to_path_buf())
        }
    }
}

impl UrlHandlerFactory for FileSystemHandler {
    fn create(&self, _session: &SessionContext) -> Option<Box<dyn UrlHandler>> {
        Some(Box::new(FileContent {
            root: self.root.clone(),
            accepts_gzip: false,
            if_modified_since: None
        }))
    }
}

struct FileContent {
    root: Arc<PathBuf>,
    accepts_gzip: bool,
    if_modified_since: Option<DateTime<FixedOffset>>
}

struct FileHandle {
    mod_date: DateTime<Utc>,
    length: u64,
    gzipped: bool,
    file: File
}

impl FileHandle {
    fn open(path: &Path, mod_date: DateTime<Utc>, gzipped: bool) -> Option<FileHandle> {
        let length = metadata(path).ok()?.len();
        match File::open(path) {
            Ok(file) => Some(FileHandle { mod_date, length, gzipped, file }),
            Err(e) => {
                debug!("error opening {}:{}", path.display(), e);
                None
            }
        }
    }

    fn is_mod_since<TZ: TimeZone>(&self, other: &DateTime<TZ>) -> bool {
        self.mod_date.timestamp() > other.timestamp()
    }
}

impl FileContent {
    fn find_content(&self, path: &Path) -> Option<FileHandle> {
        let md = match metadata(path) {
            Ok(md) if md.is_file() => md,
            _ => return None
        };
        let mod_date = DateTime::from(md.modified().ok()?);
        if self.accepts_gzip {
            let mut gz_path = path.as_os_str().to_owned();
            gz_path.push(".gz");
            if let Some(handle) = FileHandle::open(Path::new(&gz_path), mod_date, true) {
                return Some(handle);
            }
        }
        FileHandle::open(path, mod_date, false)
    }
}

impl UrlHandler for FileContent {
    fn start_request(&mut self) {
        self.accepts_gzip = false;
        self.if_modified_since = None;
    }

    fn scan_field(&mut self, _method: Method, _uri: &str, line: &str) {
        if let Some(encoding) = header_value(line, "Accept-Encoding") {
            self.accepts_gzip = encoding.contains("gzip");
        } else if let Some(date_str) = header_value(line, "If-Modified-Since") {
            self.if_modified_since = parse_if_mod_by(date_str);
        }
    }

    fn process(&mut self, request: &Request<'_>, conn: &mut Connection) -> HandlerOutcome {
        if request.method != Method::Get {
            return HandlerOutcome::NotHandled;
        }
        let path = match resolve(&self.root, request.uri) {
            Some(path) => path,
            None => return HandlerOutcome::NotHandled
        };
        let mut handle = match self.find_content(&path) {
            Some(handle) => handle,
            None => return HandlerOutcome::NotHandled
        };

        let result = match self.if_modified_since {
            Some(ref since) if !handle.is_mod_since(since) => send_response(conn, 304, &[], 0, b""),
            _ => {
                let content_type = format!("Content-Type: {}", content_type(&path));
                let last_modified = format!("Last-Modified: {}", handle.mod_date.format(HTTP_DATE));
                let mut headers = vec![content_type.as_str(), last_modified.as_str()];
                if handle.gzipped {
                    headers.push("Content-Encoding: gzip");
                }
                send_response(conn, 200, &headers, handle.length as usize, b"")
                    .and_then(|_| io::copy(&mut handle.file, conn).map(drop))
            }
        };
        match result {
            Ok(()) => HandlerOutcome::Handled,
            Err(e) => {
                debug!("error sending {}:{}", path.display(), e);
                HandlerOutcome::ErrorHandled
            }
        }
    }
}

/// Maps a request path onto `root`; anything but plain components is refused.
fn resolve(root: &Path, uri: &str) -> Option<PathBuf> {
    let relative = Path::new(uri.trim_start_matches('/'));
    if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    let path = root.join(relative);
    if path.is_dir() {
        Some(path.join(INDEX_FILE))
    } else {
        Some(path)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream"
    }
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (field, value) = line.split_once(':')?;
    if field.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

fn parse_if_mod_by(date_str: &str) -> Option<DateTime<FixedOffset>> {
    match DateTime::parse_from_rfc2822(date_str) {
        Ok(dt) => Some(dt),
        Err(e) => {
            debug!("error parsing {}:{}", date_str, e);
            None
        }
    }
}
