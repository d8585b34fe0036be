//! Integration tests for the health probe path
//!
//! A minimal in-process SOCKS5 stub accepts the handshake, then answers the
//! probe itself, so the full check pipeline (SOCKS5 dial, HTTP HEAD, status
//! classification, alive flag update) runs against a real socket.

use socks5lb::lb::{Backend, BackendCheckConfig};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Accept SOCKS5 connects (no auth) and reply to whatever HTTP request
/// follows with a fixed response.
async fn socks5_stub(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(handle_socks5(conn, response));
        }
    });

    addr
}

async fn handle_socks5(mut conn: TcpStream, response: &'static str) {
    // Method negotiation: accept whatever was offered, pick no-auth
    let mut greeting = [0u8; 2];
    if conn.read_exact(&mut greeting).await.is_err() {
        return;
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    if conn.read_exact(&mut methods).await.is_err() {
        return;
    }
    if conn.write_all(&[0x05, 0x00]).await.is_err() {
        return;
    }

    // CONNECT request; the target address is consumed and ignored
    let mut request = [0u8; 4];
    if conn.read_exact(&mut request).await.is_err() {
        return;
    }
    let addr_len = match request[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            if conn.read_exact(&mut len).await.is_err() {
                return;
            }
            len[0] as usize
        }
        _ => return,
    };
    let mut rest = vec![0u8; addr_len + 2];
    if conn.read_exact(&mut rest).await.is_err() {
        return;
    }
    if conn
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .is_err()
    {
        return;
    }

    // Now play the probe target: read the request head, send the response
    let mut buf = [0u8; 1024];
    let mut seen = Vec::new();
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }

    assert!(seen.starts_with(b"HEAD "));
    let _ = conn.write_all(response.as_bytes()).await;
}

fn probed_backend(proxy_addr: SocketAddr) -> Backend {
    Backend::new(
        proxy_addr.to_string(),
        BackendCheckConfig {
            check_url: Some(format!("http://127.0.0.1:{}/healthz", proxy_addr.port())),
            initial_alive: false,
            timeout: 2,
        },
    )
}

#[tokio::test]
async fn test_probe_200_marks_alive() {
    let proxy = socks5_stub("HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await;
    let backend = probed_backend(proxy);

    backend.check().await.unwrap();
    assert!(backend.alive());
}

#[tokio::test]
async fn test_probe_redirect_marks_alive() {
    let proxy = socks5_stub(
        "HTTP/1.1 302 Found\r\nlocation: /elsewhere\r\ncontent-length: 0\r\n\r\n",
    )
    .await;
    let backend = probed_backend(proxy);

    backend.check().await.unwrap();
    assert!(backend.alive());
}

#[tokio::test]
async fn test_probe_500_marks_dead() {
    let proxy =
        socks5_stub("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n").await;
    let backend = probed_backend(proxy);
    backend.set_alive(true);

    assert!(backend.check().await.is_err());
    assert!(!backend.alive());
}

#[tokio::test]
async fn test_probe_timeout_marks_dead() {
    // Accepts the TCP connection but never answers the SOCKS5 handshake
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((conn, _)) => held.push(conn),
                Err(_) => return,
            }
        }
    });

    let backend = Backend::new(
        proxy.to_string(),
        BackendCheckConfig {
            check_url: Some("http://127.0.0.1:80/healthz".to_string()),
            initial_alive: true,
            timeout: 1,
        },
    );

    assert!(backend.check().await.is_err());
    assert!(!backend.alive());
}
