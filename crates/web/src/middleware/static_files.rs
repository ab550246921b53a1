use crate::content::stat;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::Handler;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{ACCEPT_ENCODING, ALLOW, CACHE_CONTROL, CONTENT_ENCODING};
use http::{HeaderValue, Method, StatusCode};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const ALLOW_STATIC: &str = "OPTIONS, GET, HEAD";
const GZIP_MIN_SIZE: u64 = 1024;
const GZIP_DIR: &str = ".gzip";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Serves files under `root` for requests the rest of the chain answers with 404.
///
/// Compressible files of at least 1 KiB are served gzip-encoded to clients that accept
/// it. The compressed companions are cached under `<root>/.gzip/` and regenerated
/// whenever they are missing or older than their source.
#[derive(Debug, Clone)]
pub struct Static {
    root: PathBuf,
    max_age: u32,
    gzip_exts: HashSet<String>,
}

impl Static {
    /// `max_age` in seconds; zero leaves `Cache-Control` unset.
    pub fn new(root: impl Into<PathBuf>, max_age: u32) -> Self {
        let gzip_exts = [".html", ".css", ".js"].into_iter().map(String::from).collect();
        Self { root: root.into(), max_age, gzip_exts }
    }

    /// Adds an extension, with or without the leading dot, to the gzip set.
    pub fn gzip_ext(mut self, ext: impl AsRef<str>) -> Self {
        let ext = ext.as_ref().trim_start_matches('.').to_ascii_lowercase();
        self.gzip_exts.insert(format!(".{ext}"));
        self
    }

    fn compressible(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
            .is_some_and(|ext| self.gzip_exts.contains(&ext))
    }

    async fn serve(&self, ctx: &Context, relative: &str) -> Result<()> {
        let mut relative = PathBuf::from(relative.trim_start_matches('/'));
        let mut path = self.root.join(&relative);
        let mut meta = stat(&path).await?;
        while meta.is_dir() {
            relative.push("index.html");
            path.push("index.html");
            meta = stat(&path).await?;
        }

        if self.max_age > 0 {
            ctx.set_header(CACHE_CONTROL, HeaderValue::from_str(&format!("max-age={}", self.max_age)).map_err(Error::other)?);
        }

        if meta.len() < GZIP_MIN_SIZE || !self.compressible(&path) || !accepts_gzip(ctx) {
            return ctx.file(&path).await;
        }

        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let companion = self.root.join(GZIP_DIR).join(&relative);
        let file = match refresh_companion(&path, modified, &companion).await {
            Ok(()) => tokio::fs::File::open(&companion).await,
            Err(e) => Err(e),
        };
        let file = match file {
            Ok(file) => file,
            Err(e) => {
                warn!(companion = %companion.display(), cause = %e, "gzip companion unavailable, serving raw file");
                return ctx.file(&path).await;
            }
        };

        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        ctx.set_header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        ctx.content(&name, modified, file).await
    }
}

#[async_trait]
impl Handler for Static {
    async fn call(&self, ctx: Context) -> Result<()> {
        let err = match ctx.next().await {
            Err(err) if err.is_not_found() => err,
            other => return other,
        };

        let method = ctx.method();
        if method == Method::OPTIONS {
            ctx.set_header(ALLOW, HeaderValue::from_static(ALLOW_STATIC));
            ctx.write(StatusCode::OK, "", ());
            return Ok(());
        }
        if method != Method::GET && method != Method::HEAD {
            return Err(err);
        }

        let relative = ctx.remaining_path();
        if relative.contains("..") {
            debug!(path = ctx.path(), "rejected path outside the static root");
            return Err(err);
        }

        let result = self.serve(&ctx, relative).await;
        if result.is_err() {
            // the error page is not the encoded file
            ctx.remove_header(CONTENT_ENCODING);
            ctx.remove_header(CACHE_CONTROL);
        }
        match result {
            Err(e) if e.is_not_found() => Err(err),
            other => other,
        }
    }
}

fn accepts_gzip(ctx: &Context) -> bool {
    ctx.headers()
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("gzip"))
}

async fn refresh_companion(source: &Path, source_modified: SystemTime, companion: &Path) -> io::Result<()> {
    let fresh = match tokio::fs::metadata(companion).await {
        Ok(meta) => meta.modified().is_ok_and(|modified| modified >= source_modified),
        Err(_) => false,
    };
    if fresh {
        return Ok(());
    }

    debug!(source = %source.display(), companion = %companion.display(), "regenerating gzip companion");
    let (source, companion) = (source.to_path_buf(), companion.to_path_buf());
    tokio::task::spawn_blocking(move || compress(&source, &companion)).await.map_err(io::Error::other)?
}

fn compress(source: &Path, companion: &Path) -> io::Result<()> {
    if let Some(parent) = companion.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp = companion.as_os_str().to_owned();
    tmp.push(format!(".{}.{}.tmp", std::process::id(), TMP_SEQ.fetch_add(1, Ordering::Relaxed)));
    let tmp = PathBuf::from(tmp);

    let written = write_gzip(source, &tmp).and_then(|()| std::fs::rename(&tmp, companion));
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}

fn write_gzip(source: &Path, target: &Path) -> io::Result<()> {
    let mut input = File::open(source)?;
    let mut encoder = GzEncoder::new(BufWriter::new(File::create(target)?), Compression::best());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()
}
