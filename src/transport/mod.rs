//! Bidirectional byte relay between two stream endpoints.
//!
//! Copy buffers are pooled rather than allocated per connection to bound
//! allocation churn under high connection turnover.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Size of each copy buffer
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on idle buffers retained by the pool
const MAX_POOLED_BUFFERS: usize = 64;

struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn get(&'static self) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE]);

        PooledBuffer {
            buf: Some(buf),
            pool: self,
        }
    }

    fn put(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buf);
        }
    }
}

fn pool() -> &'static BufferPool {
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(|| BufferPool {
        free: Mutex::new(Vec::new()),
    })
}

/// A copy buffer checked out of the pool; returned on drop
struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: &'static BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Copy bytes from `src` to `dst` until end of stream, using a pooled buffer
async fn copy_buffered<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool().get();
    let mut copied = 0u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            // End of stream is a normal termination, not an error
            return Ok(copied);
        }
        dst.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
}

/// Relay bytes between `a` and `b` in both directions.
///
/// Returns as soon as either direction finishes or errors; the other
/// direction is not awaited. Both endpoints are owned by the relay and are
/// closed when it returns, which unblocks whatever the abandoned side was
/// doing.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        r = copy_buffered(&mut a_read, &mut b_write) => r,
        r = copy_buffered(&mut b_read, &mut a_write) => r,
    };

    trace!("transport stream finished");
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        // client <-> (near_a ~ near_b) <-> server, relay in the middle
        let (mut client, near_a) = duplex(1024);
        let (near_b, mut server) = duplex(1024);

        let relay_task = tokio::spawn(relay(near_a, near_b));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one end terminates the relay without error
        drop(client);
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_large_transfer() {
        let (mut client, near_a) = duplex(64 * 1024);
        let (near_b, mut server) = duplex(64 * 1024);

        let relay_task = tokio::spawn(relay(near_a, near_b));

        // Larger than one copy buffer to force multiple read/write rounds
        let payload = vec![0xa5u8; BUFFER_SIZE * 3 + 17];
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            drop(client);
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_eof_is_not_an_error() {
        let (client, near_a) = duplex(64);
        let (near_b, server) = duplex(64);

        // Close both ends immediately; the relay must resolve cleanly
        drop(client);
        drop(server);

        relay(near_a, near_b).await.unwrap();
    }

    #[tokio::test]
    async fn test_buffers_are_reused() {
        for _ in 0..4 {
            let (mut client, near_a) = duplex(256);
            let (near_b, mut server) = duplex(256);
            let relay_task = tokio::spawn(relay(near_a, near_b));

            client.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            server.read_exact(&mut buf).await.unwrap();

            drop(client);
            drop(server);
            relay_task.await.unwrap().unwrap();
        }

        // After the relays finish, buffers have gone back to the pool
        assert!(!pool().free.lock().unwrap().is_empty());
    }
}
