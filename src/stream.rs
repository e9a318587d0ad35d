//! Asynchronous encrypted stream based on the `tokio` runtime.

use core::{
    pin::Pin,
    task::{ready, Context, Poll},
};
use std::{
    io::{self, ErrorKind},
    sync::Arc,
};

use bytes::BytesMut;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    codec::{ChunkOpener, ChunkSealer, StreamDecryptor, StreamEncryptor, MAX_CHUNK_LEN},
    config::CipherProfile,
    error::Error,
};

pin_project! {
    /// One encrypted relay connection over an `AsyncRead + AsyncWrite`
    /// transport.
    ///
    /// [`ShadowStream`] implements [`AsyncRead`] and [`AsyncWrite`],
    /// allowing it to be used similarly to a [`TcpStream`]: reads return
    /// decrypted payload, writes are encrypted before they reach the
    /// transport. The first write puts this direction's IV on the wire and
    /// the first read consumes (and replay-checks) the peer's.
    ///
    /// When one-time auth is in effect, the request direction additionally
    /// carries authenticated chunks: a [`ChunkSealer`] is installed on the
    /// writing side or a [`ChunkOpener`] on the reading side. The server
    /// and tunnel engines do this after the header exchange.
    ///
    /// [`TcpStream`]: tokio::net::TcpStream
    pub struct ShadowStream<IO> {
        stream: IO,
        encryptor: StreamEncryptor,
        decryptor: StreamDecryptor,
        // Ciphertext staged while the peer's IV is still incomplete.
        raw: BytesMut,
        // Decrypted (and, with auth, verified) payload not yet delivered.
        pending: BytesMut,
        opener: Option<ChunkOpener>,
        sealer: Option<ChunkSealer>,
        write_state: WriteState,
    }
}

/// State Transition Diagram
/// ```text
///
///    |
///    V
///  Ready <---+
///    |       |
///    V       |
///  Writing --+
/// ```
#[derive(Debug)]
enum WriteState {
    Ready,
    Writing {
        wire: Vec<u8>,
        written: usize,
        consumed: usize,
    },
}

impl<IO> ShadowStream<IO> {
    /// Creates a new [`ShadowStream`] over `stream` using the process-wide
    /// cipher profile.
    pub fn with_profile_in(profile: Arc<CipherProfile>, stream: IO) -> Self {
        Self {
            stream,
            encryptor: StreamEncryptor::new(profile.clone()),
            decryptor: StreamDecryptor::new(profile),
            raw: BytesMut::new(),
            pending: BytesMut::new(),
            opener: None,
            sealer: None,
            write_state: WriteState::Ready,
        }
    }

    /// Returns a reference to the inner transport.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the inner transport.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }

    /// The IV this endpoint sends. Available before the first write, which
    /// is what header authentication is keyed on.
    pub(crate) fn local_iv(&self) -> &[u8] {
        self.encryptor.iv()
    }

    /// The IV received from the peer; empty until the first read completed
    /// IV establishment.
    pub(crate) fn peer_iv(&self) -> &[u8] {
        self.decryptor.iv()
    }

    /// Starts verifying authenticated chunks on the read side.
    ///
    /// Decrypted bytes that were buffered but not yet delivered are run
    /// through the opener, so no payload escapes verification.
    pub(crate) fn set_read_auth(&mut self, mut opener: ChunkOpener) -> Result<(), Error> {
        if !self.pending.is_empty() {
            let buffered = self.pending.split();
            opener.feed(&buffered, &mut self.pending)?;
        }
        self.opener = Some(opener);
        Ok(())
    }

    /// Starts sealing writes into authenticated chunks.
    pub(crate) fn set_write_auth(&mut self, sealer: ChunkSealer) {
        self.sealer = Some(sealer);
    }
}

impl<IO> AsyncRead for ShadowStream<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.project();
        loop {
            if !me.pending.is_empty() {
                let n = me.pending.len().min(buf.remaining());
                buf.put_slice(&me.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let mut scratch = [0u8; 16 * 1024];
            let mut read_buf = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut *me.stream).poll_read(cx, &mut read_buf)?);
            let filled = read_buf.filled();
            if filled.is_empty() {
                // EOF. A fragment short of a full IV is dropped silently.
                return Poll::Ready(Ok(()));
            }
            me.raw.extend_from_slice(filled);

            if me.decryptor.needs_iv() {
                if me.raw.len() < me.decryptor.iv_len() {
                    continue;
                }
                let iv = me.raw.split_to(me.decryptor.iv_len());
                if let Err(e) = me.decryptor.take_iv(&iv) {
                    return Poll::Ready(Err(e.into()));
                }
            }
            if me.raw.is_empty() {
                continue;
            }

            let mut data = me.raw.split();
            if let Err(e) = me.decryptor.decrypt(&mut data) {
                return Poll::Ready(Err(e.into()));
            }
            let result = match me.opener.as_mut() {
                Some(opener) => opener.feed(&data, me.pending),
                None => {
                    me.pending.extend_from_slice(&data);
                    Ok(())
                }
            };
            if let Err(e) = result {
                return Poll::Ready(Err(e.into()));
            }
            // An opener can be mid-chunk with nothing deliverable yet; the
            // loop keeps reading in that case.
        }
    }
}

impl<IO> AsyncWrite for ShadowStream<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.project();
        loop {
            match me.write_state {
                WriteState::Ready => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let consumed = buf.len().min(MAX_CHUNK_LEN);
                    let chunk = &buf[..consumed];
                    let mut wire = Vec::new();
                    let sealed = match me.sealer.as_mut() {
                        Some(sealer) => {
                            let framed = sealer.seal(chunk);
                            me.encryptor.encrypt_into(&framed, &mut wire)
                        }
                        None => me.encryptor.encrypt_into(chunk, &mut wire),
                    };
                    if let Err(e) = sealed {
                        return Poll::Ready(Err(e.into()));
                    }
                    *me.write_state = WriteState::Writing {
                        wire,
                        written: 0,
                        consumed,
                    };
                }
                WriteState::Writing {
                    wire,
                    written,
                    consumed,
                } => {
                    while *written < wire.len() {
                        let n = ready!(Pin::new(&mut *me.stream).poll_write(cx, &wire[*written..])?);
                        if n == 0 {
                            return Poll::Ready(Err(ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    let consumed = *consumed;
                    *me.write_state = WriteState::Ready;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.project();
        Pin::new(&mut *me.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let me = self.project();
        Pin::new(&mut *me.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::spawn;

    use super::*;
    use crate::{
        codec::{ChunkOpener, ChunkSealer},
        config::Config,
        crypto::CipherKind,
        error::BadDataReceived,
    };

    fn profile(kind: CipherKind) -> Arc<CipherProfile> {
        Arc::new(CipherProfile::new(
            &Config::builder_with_passphrase("test")
                .with_cipher(kind)
                .no_auth(),
        ))
    }

    #[tokio::test]
    async fn test_async_read_write_echo() {
        const DATA_LEN: usize = 65536 * 4;
        let data = Arc::new(vec![0x5au8; DATA_LEN]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_profile = profile(CipherKind::Aes256Cfb);
        let server_task = spawn(async move {
            let (server_inner, _) = listener.accept().await.unwrap();
            let mut server_stream = ShadowStream::with_profile_in(server_profile, server_inner);

            let mut buf = vec![0u8; DATA_LEN];
            server_stream.read_exact(&mut buf).await.unwrap();
            server_stream.write_all(&buf).await.unwrap();
        });

        let client_data = data.clone();
        let client_task = spawn(async move {
            let client_inner = TcpStream::connect(addr).await.unwrap();
            let mut client_stream =
                ShadowStream::with_profile_in(profile(CipherKind::Aes256Cfb), client_inner);

            client_stream.write_all(&client_data).await.unwrap();
            let mut buf = vec![0u8; DATA_LEN];
            client_stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf[..], &client_data[..]);
        });

        server_task.await.unwrap();
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_echo_across_cipher_families() {
        for kind in [CipherKind::Table, CipherKind::Rc4Md5, CipherKind::Chacha20Ietf] {
            let (a, b) = duplex(4096);
            let mut left = ShadowStream::with_profile_in(profile(kind), a);
            let mut right = ShadowStream::with_profile_in(profile(kind), b);

            left.write_all(b"ping over an encrypted pair").await.unwrap();
            let mut buf = [0u8; 27];
            right.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping over an encrypted pair");

            right.write_all(b"pong").await.unwrap();
            let mut buf = [0u8; 4];
            left.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        }
    }

    #[tokio::test]
    async fn test_chunk_auth_between_sealer_and_opener() {
        let (a, b) = duplex(4096);
        let mut writer = ShadowStream::with_profile_in(profile(CipherKind::Aes128Cfb), a);
        let mut reader = ShadowStream::with_profile_in(profile(CipherKind::Aes128Cfb), b);

        let iv = writer.local_iv().to_vec();
        writer.set_write_auth(ChunkSealer::new(&iv));
        writer.write_all(b"first").await.unwrap();
        writer.write_all(b"second").await.unwrap();

        // The test knows the sender's IV out of band; the server learns it
        // from the stream prefix before installing its opener.
        reader.set_read_auth(ChunkOpener::new(&iv)).unwrap();
        let mut buf = [0u8; 11];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"firstsecond");
        assert_eq!(reader.peer_iv(), &iv[..]);
    }

    #[tokio::test]
    async fn test_chunk_auth_key_mismatch_errors_out() {
        let (a, b) = duplex(4096);
        let shared = profile(CipherKind::Aes128Cfb);
        let mut writer = ShadowStream::with_profile_in(shared.clone(), a);

        let iv = writer.local_iv().to_vec();
        writer.set_write_auth(ChunkSealer::new(&iv));
        writer.write_all(b"payload").await.unwrap();

        // An opener keyed on the wrong IV must fail the first chunk.
        let mut reader = ShadowStream::with_profile_in(shared, b);
        reader.set_read_auth(ChunkOpener::new(&[0u8; 16])).unwrap();
        let mut buf = [0u8; 64];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(
            Error::from_io(&err).unwrap(),
            &Error::BadDataReceived(BadDataReceived::ChunkAuthFailed)
        );
    }

    #[tokio::test]
    async fn test_replayed_stream_is_rejected() {
        let shared = profile(CipherKind::Aes256Cfb);

        // Record one full encrypted stream.
        let (a, mut b) = duplex(4096);
        let mut writer = ShadowStream::with_profile_in(shared.clone(), a);
        writer.write_all(b"recorded request").await.unwrap();
        let mut recorded = vec![0u8; 64];
        let n = b.read(&mut recorded).await.unwrap();
        recorded.truncate(n);

        // First presentation of the IV is accepted.
        let (mut tx, rx) = duplex(4096);
        let mut first = ShadowStream::with_profile_in(shared.clone(), rx);
        tx.write_all(&recorded).await.unwrap();
        let mut buf = [0u8; 64];
        let n = first.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"recorded request");

        // Replaying the identical bytes hits the IV cache.
        let (mut tx, rx) = duplex(4096);
        let mut second = ShadowStream::with_profile_in(shared, rx);
        tx.write_all(&recorded).await.unwrap();
        let err = second.read(&mut buf).await.unwrap_err();
        assert_eq!(
            Error::from_io(&err).unwrap(),
            &Error::BadDataReceived(BadDataReceived::ReusedIv)
        );
    }

    #[tokio::test]
    async fn test_eof_before_full_iv_is_quiet() {
        let (mut tx, rx) = duplex(64);
        let mut stream = ShadowStream::with_profile_in(profile(CipherKind::Aes128Cfb), rx);
        tx.write_all(&[0u8; 7]).await.unwrap();
        drop(tx);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}
