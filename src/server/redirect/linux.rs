use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use crate::config;
use crate::lb::{Backend, BackendError, Pool};
use crate::transport;

/// Default interval between upstream re-selections, in seconds
/// (overridable via `SELECT_TIME_INTERVAL`)
const DEFAULT_SELECT_INTERVAL_SECS: u64 = 300;

#[derive(Error, Debug)]
enum RedirectError {
    #[error("no upstream SOCKS5 backend is currently selected")]
    NoUpstream,

    #[error("only IPv4 destinations can be recovered from redirected sockets")]
    UnsupportedFamily,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream dial failed: {0}")]
    Backend(#[from] BackendError),
}

/// The backend all intercepted connections are forwarded through.
///
/// Replacement takes the write lock briefly; connection tasks snapshot the
/// `Arc` and never hold the lock across a dial or relay. One backend serves
/// every transparent connection between refresh ticks, unlike the
/// per-connection selection of the SOCKS5 listener.
#[derive(Default)]
struct CurrentBackend {
    inner: RwLock<Option<Arc<Backend>>>,
}

impl CurrentBackend {
    fn get(&self) -> Option<Arc<Backend>> {
        self.inner.read().expect("current backend lock poisoned").clone()
    }

    /// Install `next` unless it is already current; returns whether a swap
    /// happened. The previous selection is simply dropped — in-flight
    /// connections own their streams and drain on their own.
    fn replace_if_changed(&self, next: Arc<Backend>) -> bool {
        let mut current = self.inner.write().expect("current backend lock poisoned");
        match current.as_ref() {
            Some(previous) if Arc::ptr_eq(previous, &next) => false,
            _ => {
                *current = Some(next);
                true
            }
        }
    }
}

/// Listen for kernel-redirected TCP connections on `addr` and forward each
/// to its original destination through the currently selected backend.
pub async fn listen(pool: Arc<Pool>, addr: String) -> anyhow::Result<()> {
    let listener = bind_transparent(&addr)?;
    info!("transparent proxy listening on {}", addr);

    let current = Arc::new(CurrentBackend::default());

    let select_interval =
        config::secs_from_env("SELECT_TIME_INTERVAL", DEFAULT_SELECT_INTERVAL_SECS);
    info!(
        "auto-selecting the upstream SOCKS5 backend every {:?}",
        select_interval
    );

    {
        let pool = Arc::clone(&pool);
        let current = Arc::clone(&current);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(select_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                trace!("refreshing current upstream backend");
                match pool.next() {
                    Some(backend) => {
                        let addr = backend.addr.clone();
                        if current.replace_if_changed(backend) {
                            info!("selected upstream SOCKS5 backend {}", addr);
                        }
                    }
                    // A bad tick is logged and swallowed; the next tick retries
                    None => error!("no healthy backend available for transparent proxying"),
                }
            }
        });
    }

    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("failed to accept redirected connection: {}", e);
                continue;
            }
        };

        let current = Arc::clone(&current);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(conn, peer, current).await {
                error!("[red-tcp] {}: {}", peer, e);
            }
        });
    }
}

/// Forward one intercepted connection. Fail-closed: without a current
/// backend the connection is dropped, never passed through directly.
async fn handle_connection(
    conn: TcpStream,
    peer: SocketAddr,
    current: Arc<CurrentBackend>,
) -> Result<(), RedirectError> {
    let backend = current.get().ok_or(RedirectError::NoUpstream)?;

    let dst = original_dst(&conn)?;
    trace!("[red-tcp] {} -> {} via {}", peer, dst, backend.addr);

    let upstream = backend
        .socks5_connect(&dst.to_string(), Duration::ZERO)
        .await?;

    if let Err(e) = transport::relay(conn, upstream).await {
        debug!("transport error: {}", e);
    }

    Ok(())
}

/// Recover the pre-NAT destination address from a redirected socket.
/// SO_ORIGINAL_DST only exists for IPv4; anything else is an explicit error
/// rather than a silently wrong address.
fn original_dst(stream: &TcpStream) -> Result<SocketAddr, RedirectError> {
    let sock = socket2::SockRef::from(stream);
    let addr = sock.original_dst()?;

    match addr.as_socket() {
        Some(dst @ SocketAddr::V4(_)) => Ok(dst),
        _ => Err(RedirectError::UnsupportedFamily),
    }
}

/// Build the listener by hand: IP_TRANSPARENT lets the socket accept
/// connections whose destination is a foreign address redirected here by
/// the kernel.
fn bind_transparent(addr: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .context(format!("invalid transparent proxy address: {}", addr))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("failed to create transparent proxy socket")?;

    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket
        .set_ip_transparent(true)
        .context("failed to set IP_TRANSPARENT (requires CAP_NET_ADMIN)")?;

    socket
        .bind(&addr.into())
        .context(format!("failed to bind transparent proxy on {}", addr))?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into()).context("failed to register transparent proxy listener")
}
