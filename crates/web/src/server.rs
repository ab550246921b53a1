use crate::router::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ServerBuilder {
    router: Option<Router>,
    address: Option<io::Result<Vec<SocketAddr>>>,
    tls: Option<(PathBuf, PathBuf)>,
    header_read_timeout: Duration,
    keep_alive: bool,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { router: None, address: None, tls: None, header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT, keep_alive: true }
    }

    pub fn address<A: ToSocketAddrs>(mut self, address: A) -> Self {
        self.address = Some(address.to_socket_addrs().map(Iterator::collect));
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Serves HTTPS with the PEM encoded certificate chain and private key.
    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some((cert.into(), key.into()));
        self
    }

    pub fn header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        let router = self.router.ok_or(ServerBuildError::MissingRouter)?;
        let address = self.address.ok_or(ServerBuildError::MissingAddress)?.map_err(ServerBuildError::InvalidAddress)?;
        let tls = match &self.tls {
            Some((cert, key)) => Some(tls_acceptor(cert, key)?),
            None => None,
        };
        Ok(Server {
            router: Arc::new(router),
            address,
            tls,
            header_read_timeout: self.header_read_timeout,
            keep_alive: self.keep_alive,
        })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("tls", &self.tls)
            .field("header_read_timeout", &self.header_read_timeout)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

pub struct Server {
    router: Arc<Router>,
    address: Vec<SocketAddr>,
    tls: Option<TlsAcceptor>,
    header_read_timeout: Duration,
    keep_alive: bool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.address)
            .field("tls", &self.tls.is_some())
            .field("header_read_timeout", &self.header_read_timeout)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("router must be set")]
    MissingRouter,

    #[error("address must be set")]
    MissingAddress,

    #[error("invalid address: {0}")]
    InvalidAddress(#[source] io::Error),

    #[error("failed to read tls file {path}: {source}")]
    TlsFile { path: PathBuf, source: io::Error },

    #[error("no private key found in {0}")]
    MissingPrivateKey(PathBuf),

    #[error("invalid tls config: {0}")]
    TlsConfig(#[from] tokio_rustls::rustls::Error),
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Installs the log subscriber, binds and serves until Ctrl-C.
    ///
    /// The log filter is read from `RUST_LOG` and defaults to `info`. An already
    /// installed global subscriber is kept.
    pub async fn start(self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
            debug!("global subscriber already installed");
        }

        info!(address = ?self.address, tls = self.tls.is_some(), "start listening");
        let tcp_listener = match TcpListener::bind(self.address.as_slice()).await {
            Ok(tcp_listener) => tcp_listener,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return;
            }
        };

        let server = Arc::new(self);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                accepted = tcp_listener.accept() => match accepted {
                    Ok(stream_and_addr) => stream_and_addr,
                    Err(e) => {
                        warn!(cause = %e, "failed to accept");
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("received ctrl-c, stop accepting");
                    break;
                }
            };

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                match &server.tls {
                    Some(acceptor) => match acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => server.serve_connection(tls_stream, remote_addr).await,
                        Err(e) => warn!(%remote_addr, cause = %e, "tls handshake failed"),
                    },
                    None => server.serve_connection(tcp_stream, remote_addr).await,
                }
            });
        }
    }

    async fn serve_connection<I>(&self, io: I, remote_addr: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let router = Arc::clone(&self.router);
        let service = service_fn(move |req: Request<Incoming>| {
            let router = Arc::clone(&router);
            async move { Ok::<_, Infallible>(router.serve(req, Some(remote_addr)).await) }
        });

        let connection = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .keep_alive(self.keep_alive)
            .serve_connection(TokioIo::new(io), service);

        match connection.await {
            Ok(()) => debug!(%remote_addr, "connection closed"),
            Err(e) => error!(%remote_addr, cause = %e, "connection error"),
        }
    }
}

fn tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor, ServerBuildError> {
    let open = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|source| ServerBuildError::TlsFile { path: path.to_path_buf(), source })
    };

    let certs = rustls_pemfile::certs(&mut open(cert)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ServerBuildError::TlsFile { path: cert.to_path_buf(), source })?;
    let private_key = rustls_pemfile::private_key(&mut open(key)?)
        .map_err(|source| ServerBuildError::TlsFile { path: key.to_path_buf(), source })?
        .ok_or_else(|| ServerBuildError::MissingPrivateKey(key.to_path_buf()))?;

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(certs, private_key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
