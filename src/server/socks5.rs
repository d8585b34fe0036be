use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::lb::Pool;
use crate::transport;

/// Timeout for dialing a backend
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval for TCP keepalive probes on both relay legs
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Accept SOCKS5 client connections and pass them through to pool backends.
///
/// The SOCKS5 protocol is never parsed here: each client negotiates with the
/// backend it lands on, and this listener only moves bytes. Takes an already
/// bound listener so callers control the bind (and its failure is fatal at
/// startup, unlike anything below).
pub async fn serve(pool: Arc<Pool>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("failed to accept connection: {}", e);
                continue;
            }
        };

        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            handle_connection(pool, conn, peer).await;
        });
    }
}

/// Bind the listener and serve forever
pub async fn listen(pool: Arc<Pool>, addr: String) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = TcpListener::bind(&addr)
        .await
        .context(format!("failed to bind SOCKS5 listener on {}", addr))?;

    info!("SOCKS5 proxy listening on {}", addr);
    serve(pool, listener).await
}

/// Relay one client connection through the next healthy backend.
///
/// Every failure path simply drops the client connection; nothing here may
/// affect other connections.
async fn handle_connection(pool: Arc<Pool>, client: TcpStream, peer: SocketAddr) {
    if let Err(e) = set_keepalive(&client) {
        warn!("failed to set keepalive: {}", e);
    }

    let Some(backend) = pool.next() else {
        error!("no healthy backend available, closing connection from {}", peer);
        return;
    };

    let backend_conn =
        match tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, TcpStream::connect(&backend.addr)).await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                error!("failed to dial backend {}: {}", backend.addr, e);
                return;
            }
            Err(_) => {
                error!(
                    "timed out dialing backend {} after {:?}",
                    backend.addr, DEFAULT_DIAL_TIMEOUT
                );
                return;
            }
        };

    if let Err(e) = set_keepalive(&backend_conn) {
        warn!("failed to set backend keepalive: {}", e);
    }

    // Expected to end with EOF or a benign reset when either side hangs up
    if let Err(e) = transport::relay(client, backend_conn).await {
        debug!("transport error: {}", e);
    }
}

/// Enable TCP keepalive so dead peers are noticed on long-idle relays
fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(DEFAULT_KEEPALIVE_PERIOD);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
