//! Bidirectional splicing between a client stream and its upstream.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::BUF_SIZE;

enum CopyEvent {
    ClientRead(io::Result<usize>),
    RemoteRead(io::Result<usize>),
}

/// Splices two streams until both directions are done, an error occurs, or
/// no byte moves in either direction for `idle_timeout`.
///
/// EOF on one side half-closes the other side's write half and keeps
/// draining the opposite direction. Returns `(client_to_remote,
/// remote_to_client)` byte counts; errors out of either stream (including
/// protocol errors surfaced by a [`ShadowStream`]) are returned to the
/// caller for classification.
///
/// [`ShadowStream`]: crate::ShadowStream
pub(crate) async fn splice<A, B>(
    mut client: A,
    mut remote: B,
    idle_timeout: Duration,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; BUF_SIZE];
    let mut remote_buf = vec![0u8; BUF_SIZE];

    let mut uploaded: u64 = 0;
    let mut downloaded: u64 = 0;
    let mut client_done = false;
    let mut remote_done = false;

    while !(client_done && remote_done) {
        // Any activity on either side re-arms the idle timer.
        let event = timeout(idle_timeout, async {
            tokio::select! {
                r = client.read(&mut client_buf), if !client_done => CopyEvent::ClientRead(r),
                r = remote.read(&mut remote_buf), if !remote_done => CopyEvent::RemoteRead(r),
            }
        })
        .await;

        match event {
            Err(_) => {
                debug!(uploaded, downloaded, "connection idle timeout, closing");
                break;
            }
            Ok(CopyEvent::ClientRead(Ok(0))) => {
                client_done = true;
                let _ = remote.shutdown().await;
            }
            Ok(CopyEvent::ClientRead(Ok(n))) => {
                remote.write_all(&client_buf[..n]).await?;
                uploaded += n as u64;
            }
            Ok(CopyEvent::ClientRead(Err(e))) => return Err(e),
            Ok(CopyEvent::RemoteRead(Ok(0))) => {
                remote_done = true;
                let _ = client.shutdown().await;
            }
            Ok(CopyEvent::RemoteRead(Ok(n))) => {
                client.write_all(&remote_buf[..n]).await?;
                downloaded += n as u64;
            }
            Ok(CopyEvent::RemoteRead(Err(e))) => return Err(e),
        }
    }

    Ok((uploaded, downloaded))
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (mut client_a, client_b) = duplex(1024);
        let (remote_a, mut remote_b) = duplex(1024);

        let handle =
            tokio::spawn(async move { splice(client_b, remote_a, Duration::from_secs(5)).await });

        client_a.write_all(b"hello world").await.unwrap();
        let mut buf = [0u8; 64];
        let n = remote_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");

        remote_b.write_all(b"response").await.unwrap();
        let n = client_a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"response");

        client_a.shutdown().await.unwrap();
        remote_b.shutdown().await.unwrap();

        let (up, down) = handle.await.unwrap().unwrap();
        assert_eq!(up, 11);
        assert_eq!(down, 8);
    }

    #[tokio::test]
    async fn test_splice_half_close_drains_remaining() {
        let (mut client_a, client_b) = duplex(1024);
        let (remote_a, mut remote_b) = duplex(1024);

        let handle =
            tokio::spawn(async move { splice(client_b, remote_a, Duration::from_secs(5)).await });

        // Client finishes sending and closes; the response still flows.
        client_a.write_all(b"request").await.unwrap();
        client_a.shutdown().await.unwrap();

        let mut buf = [0u8; 64];
        let n = remote_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"request");
        assert_eq!(remote_b.read(&mut buf).await.unwrap(), 0);

        remote_b.write_all(b"late response").await.unwrap();
        remote_b.shutdown().await.unwrap();

        let n = client_a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late response");

        let (up, down) = handle.await.unwrap().unwrap();
        assert_eq!(up, 7);
        assert_eq!(down, 13);
    }

    #[tokio::test]
    async fn test_splice_idle_timeout_closes() {
        let (_client_a, client_b) = duplex(1024);
        let (remote_a, _remote_b) = duplex(1024);

        let start = Instant::now();
        let result = splice(client_b, remote_a, Duration::from_millis(50)).await;
        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
