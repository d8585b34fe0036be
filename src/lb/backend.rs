use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;
use url::Url;

/// Default timeout for health probes and backend dials
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors produced by health probes and dials through a backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("invalid check URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("check URL has no host")]
    MissingHost,

    #[error("SOCKS5 dial failed: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build probe request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unhealthy HTTP status: {0}")]
    UnhealthyStatus(StatusCode),
}

/// Health check parameters for a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendCheckConfig {
    /// URL probed through the backend; when absent the backend is static
    /// and health is pinned to `initial_alive`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_url: Option<String>,

    /// Health state before any check has run (and forever, for static backends)
    #[serde(default)]
    pub initial_alive: bool,

    /// Probe timeout in seconds; 0 falls back to the default (10s)
    #[serde(default)]
    pub timeout: u64,
}

/// One upstream SOCKS5 proxy endpoint.
///
/// The alive flag is a single atomic word: readers never block and writers
/// simply publish the most recent observation.
#[derive(Debug)]
pub struct Backend {
    /// Backend address (host:port)
    pub addr: String,

    /// Optional SOCKS5 username
    pub username: Option<String>,

    /// Optional SOCKS5 password
    pub password: Option<String>,

    /// Health check configuration
    pub check_config: BackendCheckConfig,

    alive: AtomicBool,
}

impl Backend {
    /// Create a new backend; the alive flag starts at the configured
    /// `initial_alive` value until the first check completes.
    pub fn new(addr: impl Into<String>, check_config: BackendCheckConfig) -> Self {
        let initial = check_config.initial_alive;
        Self {
            addr: addr.into(),
            username: None,
            password: None,
            check_config,
            alive: AtomicBool::new(initial),
        }
    }

    /// Create a backend from a configuration entry
    pub fn from_config(config: crate::config::BackendConfig) -> Self {
        let mut backend = Self::new(config.addr, config.check_config);
        backend.username = config.username;
        backend.password = config.password;
        backend
    }

    /// Current health state; reflects the most recently completed check,
    /// or the configured initial value if no check has run yet.
    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Atomically publish a new health state
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// Probe the backend once and update the alive flag.
    ///
    /// With a check URL configured, a HEAD request is issued through the
    /// backend's SOCKS5 endpoint and 2xx/3xx responses count as healthy.
    /// Without one, health is reset to the configured initial value.
    /// Failures are returned for logging but never retried here; the next
    /// scheduled check is the retry.
    pub async fn check(&self) -> Result<(), BackendError> {
        let Some(check_url) = self.check_config.check_url.clone() else {
            self.set_alive(self.check_config.initial_alive);
            return Ok(());
        };

        match self.http_health_check(&check_url).await {
            Ok(()) => {
                self.set_alive(true);
                Ok(())
            }
            Err(e) => {
                self.set_alive(false);
                Err(e)
            }
        }
    }

    /// Open a SOCKS5-negotiated connection to `target` through this backend,
    /// authenticating when credentials are configured. A zero timeout falls
    /// back to the default.
    pub async fn socks5_connect(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<Socks5Stream<TcpStream>, BackendError> {
        let timeout = effective_timeout(timeout);

        let dial = async {
            match (self.username.as_deref(), self.password.as_deref()) {
                (Some(user), Some(pass)) => {
                    Socks5Stream::connect_with_password(self.addr.as_str(), target, user, pass)
                        .await
                }
                _ => Socks5Stream::connect(self.addr.as_str(), target).await,
            }
        };

        tokio::time::timeout(timeout, dial)
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
            .map_err(BackendError::from)
    }

    /// The probe timeout with the zero-means-default rule applied
    pub fn check_timeout(&self) -> Duration {
        effective_timeout(Duration::from_secs(self.check_config.timeout))
    }

    /// HEAD the check URL through this backend's SOCKS5 endpoint and
    /// classify the response. The whole probe is bounded by the check
    /// timeout.
    async fn http_health_check(&self, check_url: &str) -> Result<(), BackendError> {
        let url = Url::parse(check_url)?;
        let host = url.host_str().ok_or(BackendError::MissingHost)?.to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let timeout = self.check_timeout();

        let probe = async {
            let stream = self
                .socks5_connect(&format!("{}:{}", host, port), timeout)
                .await?;

            let status = if url.scheme() == "https" {
                let connector =
                    tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
                let tls = connector.connect(&host, stream).await?;
                head_request(tls, &url, &host).await?
            } else {
                head_request(stream, &url, &host).await?
            };

            if is_healthy_status(status) {
                Ok(())
            } else {
                Err(BackendError::UnhealthyStatus(status))
            }
        };

        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
    }
}

/// Issue a HEAD request over an established connection and return the status
async fn head_request<S>(io: S, url: &Url, host: &str) -> Result<StatusCode, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("probe connection error: {}", e);
        }
    });

    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    // HEAD keeps the probe cheap; redirects are not followed, a 3xx is
    // already proof of life
    let req = Request::builder()
        .method(Method::HEAD)
        .uri(path)
        .header(hyper::header::HOST, host)
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(req).await?;
    Ok(response.status())
}

/// 2xx and 3xx responses count as healthy
pub(crate) fn is_healthy_status(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_CHECK_TIMEOUT
    } else {
        timeout
    }
}
