//! Range-capable responder for files and seekable readers.

use crate::body::ResponseBody;
use crate::context::Context;
use crate::error::{Error, Result, StatusError};
use futures::TryStreamExt;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, RANGE};
use http::{HeaderValue, Method, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;
use mime::Mime;
use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::io::ReaderStream;

impl Context {
    /// Serves `reader` as the response body.
    ///
    /// `name` only drives the `Content-Type` guess, which is skipped when a content type
    /// was already set. `modtime` is announced as `Last-Modified` and compared against
    /// `If-Modified-Since`. A single `Range: bytes=` request is answered with 206.
    pub async fn content<R>(&self, name: &str, modtime: SystemTime, mut reader: R) -> Result<()>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
    {
        if self.response_header(CONTENT_TYPE).is_none() {
            let guessed = HeaderValue::from_str(guess_mime(name).as_ref()).map_err(Error::other)?;
            self.set_header(CONTENT_TYPE, guessed);
        }

        let modtime = modtime.duration_since(UNIX_EPOCH).ok().filter(|d| !d.is_zero()).map(|d| d.as_secs());
        if let Some(secs) = modtime {
            let stamp = httpdate::fmt_http_date(UNIX_EPOCH + std::time::Duration::from_secs(secs));
            self.set_header(LAST_MODIFIED, HeaderValue::from_str(&stamp).map_err(Error::other)?);
            if self.not_modified_since(secs) {
                self.write(StatusCode::NOT_MODIFIED, "", ());
                return Ok(());
            }
        }

        let size = reader.seek(SeekFrom::End(0)).await?;
        self.set_header(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let (status, start, len) = match self.header_str(RANGE).map(|r| parse_range(r, size)) {
            None | Some(Range::Ignored) => (StatusCode::OK, 0, size),
            Some(Range::Bytes(start, end)) => {
                let content_range = format!("bytes {start}-{end}/{size}");
                self.set_header(CONTENT_RANGE, HeaderValue::from_str(&content_range).map_err(Error::other)?);
                (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
            }
            Some(Range::Unsatisfiable) => {
                let content_range = format!("bytes */{size}");
                self.set_header(CONTENT_RANGE, HeaderValue::from_str(&content_range).map_err(Error::other)?);
                return Err(StatusError::new(StatusCode::RANGE_NOT_SATISFIABLE.as_u16(), name).into());
            }
        };

        reader.seek(SeekFrom::Start(start)).await?;
        self.set_header(CONTENT_LENGTH, HeaderValue::from(len));

        if self.method() == Method::HEAD {
            self.write(status, "", ());
            return Ok(());
        }
        let stream = ReaderStream::new(reader.take(len)).map_ok(Frame::data);
        self.write(status, "", ResponseBody::stream(StreamBody::new(stream)));
        Ok(())
    }

    /// Serves the file at `path`. Directories are served through their `index.html`.
    ///
    /// A missing file yields `StatusError{NotFound}`, an unreadable one
    /// `StatusError{Forbidden}`.
    pub async fn file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut path = path.as_ref().to_path_buf();
        let mut meta = stat(&path).await?;
        while meta.is_dir() {
            path.push("index.html");
            meta = stat(&path).await?;
        }

        let file = tokio::fs::File::open(&path).await.map_err(|e| fs_error(e, &path))?;
        let modtime = meta.modified().unwrap_or(UNIX_EPOCH);
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.content(&name, modtime, file).await
    }

    fn header_str(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn not_modified_since(&self, modtime_secs: u64) -> bool {
        if self.method() != Method::GET && self.method() != Method::HEAD {
            return false;
        }
        let Some(since) = self.header_str(IF_MODIFIED_SINCE).and_then(|v| httpdate::parse_http_date(v).ok()) else {
            return false;
        };
        since.duration_since(UNIX_EPOCH).is_ok_and(|since| modtime_secs <= since.as_secs())
    }
}

pub(crate) async fn stat(path: &Path) -> Result<Metadata> {
    tokio::fs::metadata(path).await.map_err(|e| fs_error(e, path))
}

fn fs_error(e: io::Error, path: &Path) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => StatusError::not_found(path.display()).into(),
        io::ErrorKind::PermissionDenied => StatusError::forbidden(path.display()).into(),
        _ => e.into(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Range {
    /// Inclusive byte bounds.
    Bytes(u64, u64),
    Unsatisfiable,
    /// Malformed or multi-range requests are answered with the full body.
    Ignored,
}

fn parse_range(header: &str, size: u64) -> Range {
    let Some(ranges) = header.trim().strip_prefix("bytes=") else {
        return Range::Ignored;
    };
    if ranges.contains(',') {
        return Range::Ignored;
    }
    let Some((start, end)) = ranges.trim().split_once('-') else {
        return Range::Ignored;
    };

    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() {
        // suffix range: the last `end` bytes
        return match end.parse::<u64>() {
            Ok(0) => Range::Unsatisfiable,
            Ok(n) if size > 0 => Range::Bytes(size.saturating_sub(n), size - 1),
            Ok(_) => Range::Unsatisfiable,
            Err(_) => Range::Ignored,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return Range::Ignored;
    };
    if start >= size {
        return Range::Unsatisfiable;
    }
    if end.is_empty() {
        return Range::Bytes(start, size - 1);
    }
    match end.parse::<u64>() {
        Ok(end) if end >= start => Range::Bytes(start, end.min(size - 1)),
        _ => Range::Ignored,
    }
}

pub(crate) fn guess_mime(name: &str) -> Mime {
    let ext = Path::new(name).extension().map(|e| e.to_string_lossy().to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => mime::TEXT_HTML_UTF_8,
        "css" => mime::TEXT_CSS_UTF_8,
        "js" | "mjs" => mime::APPLICATION_JAVASCRIPT_UTF_8,
        "json" => mime::APPLICATION_JSON,
        "txt" => mime::TEXT_PLAIN_UTF_8,
        "csv" => mime::TEXT_CSV_UTF_8,
        "xml" => mime::TEXT_XML,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "bmp" => mime::IMAGE_BMP,
        "svg" => mime::IMAGE_SVG,
        "woff" => mime::FONT_WOFF,
        "woff2" => mime::FONT_WOFF2,
        "pdf" => mime::APPLICATION_PDF,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}
