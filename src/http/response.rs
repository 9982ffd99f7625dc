//! Response assembly: status line, headers, and body.
//!
//! The body is either the bytes of a small canned error page or a
//! memory-mapped static file -- [`Body`] tags which, so [`Connection`] can
//! write either one out without caring which it got.
//!
//! [`Connection`]: crate::connection::Connection

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use memmap2::Mmap;

use crate::buffer::ByteBuffer;

/// Sentinel meaning "no status code has been chosen yet", matching the
/// source's use of `-1` before a request is classified.
const CODE_UNSET: i32 = -1;

/// A response body, chosen once `make_response` runs.
pub enum Body {
    /// A small generated body (error pages, zero-length files).
    Inline(Vec<u8>),
    /// A memory-mapped static file, served without copying into userspace.
    Mapped(Mmap),
}

impl Body {
    /// Borrowable bytes regardless of which variant this is.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Inline(v) => v,
            Body::Mapped(m) => m,
        }
    }
}

/// An in-progress or completed HTTP/1.1 response.
pub struct Response {
    code: i32,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    body: Body,
}

impl Response {
    /// A blank response, ready for [`Response::reset`].
    pub fn new() -> Self {
        Self {
            code: CODE_UNSET,
            keep_alive: false,
            path: String::new(),
            src_dir: PathBuf::new(),
            body: Body::Inline(Vec::new()),
        }
    }

    /// Reinitializes this response for the next request on the connection.
    /// `code` is normally `-1` (unclassified); callers that already know the
    /// status (e.g. a malformed request -> 400) can pass it directly.
    pub fn reset(&mut self, src_dir: PathBuf, path: String, keep_alive: bool, code: i32) {
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path;
        self.src_dir = src_dir;
        self.body = Body::Inline(Vec::new());
    }

    /// Final status code, after classification.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// The body chosen while assembling this response.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Classifies the request, then writes the status line and headers into
    /// `buf` and chooses the body. Precedence, matching the static-file
    /// checks this is grounded on: a missing file or directory wins over a
    /// permissions problem, which wins over the default 200.
    pub fn make_response(&mut self, buf: &mut ByteBuffer) {
        if self.code == CODE_UNSET {
            match self.resolve_and_stat() {
                None => self.code = 404,
                Some(meta) if meta.is_dir() => self.code = 404,
                Some(meta) if !world_readable(&meta) => self.code = 403,
                Some(_) => self.code = 200,
            }
        }

        self.rewrite_to_error_page();
        self.add_state_line(buf);
        self.add_header(buf);
        self.add_content(buf);
    }

    /// Joins `src_dir` and `path`, rejecting any `..` component so a request
    /// can never resolve outside the configured static root. The original
    /// server this was modeled on concatenated the two strings directly,
    /// which let a crafted path escape `src_dir`; that's a defect that isn't
    /// worth reproducing, not a behavior to preserve.
    fn resolve(&self) -> Option<PathBuf> {
        let rel = self.path.trim_start_matches('/');
        let candidate = Path::new(rel);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return None;
        }
        Some(self.src_dir.join(candidate))
    }

    fn resolve_and_stat(&self) -> Option<std::fs::Metadata> {
        self.resolve().and_then(|p| std::fs::metadata(p).ok())
    }

    /// If the classified code has a canned error page, switch `path` to it.
    fn rewrite_to_error_page(&mut self) {
        if let Some(page) = error_page(self.code as u16) {
            self.path = page.to_string();
        }
    }

    fn add_state_line(&mut self, buf: &mut ByteBuffer) {
        let reason = match reason_phrase(self.code as u16) {
            Some(r) => r,
            None => {
                self.code = 400;
                reason_phrase(400).expect("400 always has a reason phrase")
            }
        };
        buf.append(format!("HTTP/1.1 {} {reason}\r\n", self.code).as_bytes());
    }

    fn add_header(&self, buf: &mut ByteBuffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", mime_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut ByteBuffer) {
        let Some(full_path) = self.resolve() else {
            self.error_content(buf, "File NotFound!");
            return;
        };

        let file = match File::open(&full_path) {
            Ok(f) => f,
            Err(_) => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };

        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            buf.append(b"Content-length: 0\r\n\r\n");
            self.body = Body::Inline(Vec::new());
            return;
        }

        // SAFETY: the file is opened read-only for the lifetime of the
        // mapping and isn't concurrently truncated by this process.
        match unsafe { Mmap::map(&file) } {
            Ok(mmap) => {
                buf.append(format!("Content-length: {len}\r\n\r\n").as_bytes());
                self.body = Body::Mapped(mmap);
            }
            Err(_) => self.error_content(buf, "File NotFound!"),
        }
    }

    fn error_content(&mut self, buf: &mut ByteBuffer, message: &str) {
        let status = reason_phrase(self.code as u16).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {status}\n<p>{message}</p><hr><em>ferrohttpd</em></body></html>",
            self.code
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
        self.body = Body::Inline(Vec::new());
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

fn world_readable(meta: &std::fs::Metadata) -> bool {
    meta.permissions().mode() & 0o004 != 0
}

fn reason_phrase(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn mime_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("html") => "text/html",
        Some("xml") => "text/xml",
        Some("xhtml") => "application/xhtml+xml",
        Some("txt") => "text/plain",
        Some("rtf") => "application/rtf",
        Some("pdf") => "application/pdf",
        Some("word") => "application/nsword",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("au") => "audio/basic",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        Some("avi") => "video/x-msvideo",
        Some("gz") => "application/x-gzip",
        Some("tar") => "application/x-tar",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt as _;

    fn tempdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ferrohttpd-response-test-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn serves_existing_file_as_200() {
        let dir = tempdir("ok");
        fs::write(dir.join("index.html"), b"<p>hi</p>").unwrap();

        let mut resp = Response::new();
        resp.reset(dir, "/index.html".to_string(), false, CODE_UNSET);
        let mut buf = ByteBuffer::with_capacity(256);
        resp.make_response(&mut buf);

        assert_eq!(resp.code(), 200);
        assert_eq!(resp.body().as_bytes(), b"<p>hi</p>");
        let head = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
    }

    #[test]
    fn missing_file_is_404() {
        let dir = tempdir("missing");
        let mut resp = Response::new();
        resp.reset(dir, "/nope.html".to_string(), false, CODE_UNSET);
        let mut buf = ByteBuffer::with_capacity(256);
        resp.make_response(&mut buf);
        assert_eq!(resp.code(), 404);
    }

    #[test]
    fn unreadable_file_is_403() {
        let dir = tempdir("forbidden");
        let file = dir.join("secret.html");
        fs::write(&file, b"top secret").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        let mut resp = Response::new();
        resp.reset(dir, "/secret.html".to_string(), false, CODE_UNSET);
        let mut buf = ByteBuffer::with_capacity(256);
        resp.make_response(&mut buf);
        assert_eq!(resp.code(), 403);
    }

    #[test]
    fn path_traversal_is_rejected_as_404() {
        let dir = tempdir("traversal");
        let mut resp = Response::new();
        resp.reset(dir, "/../../etc/passwd".to_string(), false, CODE_UNSET);
        let mut buf = ByteBuffer::with_capacity(256);
        resp.make_response(&mut buf);
        assert_eq!(resp.code(), 404);
    }

    #[test]
    fn keep_alive_adds_extra_header_line() {
        let dir = tempdir("keepalive");
        fs::write(dir.join("index.html"), b"x").unwrap();

        let mut resp = Response::new();
        resp.reset(dir, "/index.html".to_string(), true, CODE_UNSET);
        let mut buf = ByteBuffer::with_capacity(256);
        resp.make_response(&mut buf);

        let head = String::from_utf8_lossy(buf.peek()).into_owned();
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
    }

    #[test]
    fn zero_length_file_skips_mmap() {
        let dir = tempdir("empty");
        fs::write(dir.join("empty.txt"), b"").unwrap();

        let mut resp = Response::new();
        resp.reset(dir, "/empty.txt".to_string(), false, CODE_UNSET);
        let mut buf = ByteBuffer::with_capacity(256);
        resp.make_response(&mut buf);

        assert_eq!(resp.code(), 200);
        assert_eq!(resp.body().as_bytes(), b"");
        let _ = Write::flush(&mut std::io::sink());
    }
}
