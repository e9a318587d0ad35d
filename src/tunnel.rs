//! The tunnel deployment mode: accepts plaintext local connections,
//! prepends the fixed destination header, encrypts and splices to the
//! remote server.

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::{
    address::{Address, RelayHeader},
    codec::{header_tag, ChunkSealer},
    config::{CipherProfile, Config},
    relay::splice,
    stream::ShadowStream,
};

/// The tunnel deployment mode.
///
/// Every accepted local connection is relayed through `server_addr` to the
/// one fixed destination the tunnel was configured with.
pub struct Tunnel {
    profile: Arc<CipherProfile>,
    listener: TcpListener,
    server_addr: SocketAddr,
    dest: Address,
    dest_port: u16,
}

impl Tunnel {
    /// Binds the local listening socket and derives the cipher profile.
    pub async fn bind(
        listen: SocketAddr,
        server_addr: SocketAddr,
        dest: Address,
        dest_port: u16,
        config: &Config,
    ) -> io::Result<Tunnel> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Tunnel {
            profile: Arc::new(CipherProfile::new(config)),
            listener,
            server_addr,
            dest,
            dest_port,
        })
    }

    /// The bound local listening address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts local connections until the listener fails.
    pub async fn run(self) -> io::Result<()> {
        info!(
            "forwarding {} to {}:{} via {}",
            self.local_addr()?,
            self.dest,
            self.dest_port,
            self.server_addr
        );
        loop {
            let (local, peer) = self.listener.accept().await?;
            let _ = local.set_nodelay(true);

            let profile = self.profile.clone();
            let server_addr = self.server_addr;
            let header = RelayHeader {
                addr: self.dest.clone(),
                port: self.dest_port,
                auth: profile.one_time_auth(),
            };
            tokio::spawn(async move {
                if let Err(e) = forward(profile, local, server_addr, header).await {
                    debug!("tunnel connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}

async fn forward(
    profile: Arc<CipherProfile>,
    local: TcpStream,
    server_addr: SocketAddr,
    header: RelayHeader,
) -> io::Result<()> {
    let idle_timeout = profile.idle_timeout();

    let remote = TcpStream::connect(server_addr).await?;
    remote.set_nodelay(true)?;
    let mut shadow = ShadowStream::with_profile_in(profile.clone(), remote);

    // The destination header goes out before any payload. With one-time
    // auth the header carries its tag, keyed by this connection's IV, and
    // everything after it travels in sealed chunks.
    let mut header_bytes = Vec::new();
    header.encode(&mut header_bytes);
    if header.auth {
        let tag = header_tag(shadow.local_iv(), profile.key(), &header_bytes);
        header_bytes.extend_from_slice(&tag);
    }
    shadow.write_all(&header_bytes).await?;
    if header.auth {
        let sealer = ChunkSealer::new(shadow.local_iv());
        shadow.set_write_auth(sealer);
    }

    let (uploaded, downloaded) = splice(local, shadow, idle_timeout).await?;
    debug!(uploaded, downloaded, "tunnel connection finished");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncReadExt;
    use tokio::spawn;

    use super::*;
    use crate::{crypto::CipherKind, server::Server};

    async fn spawn_echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn end_to_end(kind: CipherKind, auth: bool) {
        let upstream_addr = spawn_echo_upstream().await;

        let builder = Config::builder_with_passphrase("test").with_cipher(kind);
        let config = if auth {
            builder.with_one_time_auth()
        } else {
            builder.no_auth()
        };

        let server = Server::bind("127.0.0.1:0".parse().unwrap(), &config)
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        spawn(server.run());

        let tunnel = Tunnel::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_addr,
            Address::V4(Ipv4Addr::LOCALHOST),
            upstream_addr.port(),
            &config,
        )
        .await
        .unwrap();
        let tunnel_addr = tunnel.local_addr().unwrap();
        spawn(tunnel.run());

        // A plaintext client sees a transparent pipe to the upstream.
        let mut client = TcpStream::connect(tunnel_addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

        // Back-to-back sends of different sizes arrive concatenated.
        client.write_all(&[0xaa; 10]).await.unwrap();
        client.write_all(&[0xbb; 100]).await.unwrap();
        let mut buf = [0u8; 110];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..10], &[0xaa; 10]);
        assert_eq!(&buf[10..], &[0xbb; 100]);
    }

    #[tokio::test]
    async fn test_end_to_end_aes_256_cfb() {
        end_to_end(CipherKind::Aes256Cfb, false).await;
    }

    #[tokio::test]
    async fn test_end_to_end_chacha20_ietf() {
        end_to_end(CipherKind::Chacha20Ietf, false).await;
    }

    #[tokio::test]
    async fn test_end_to_end_salsa20() {
        end_to_end(CipherKind::Salsa20, false).await;
    }

    #[tokio::test]
    async fn test_end_to_end_rc4_md5() {
        end_to_end(CipherKind::Rc4Md5, false).await;
    }

    #[tokio::test]
    async fn test_end_to_end_table() {
        end_to_end(CipherKind::Table, false).await;
    }

    #[tokio::test]
    async fn test_end_to_end_with_one_time_auth() {
        end_to_end(CipherKind::Aes128Cfb, true).await;
    }

    #[tokio::test]
    async fn test_end_to_end_with_auth_and_stream_cipher() {
        end_to_end(CipherKind::Chacha20, true).await;
    }
}
