//! The server engine: accepts encrypted connections, decrypts the request
//! header, dials the named destination and splices both directions.
//!
//! Per connection the pipeline is `WAIT_HEADER` (accumulate decrypted
//! bytes until the header and, when required, its auth tag are complete)
//! then `RESOLVING`/`CONNECTING` (the dial await point) then `SPLICING`.
//! Any failure closes both sides; tamper evidence is reported and, in
//! black-list ACL mode, auto-banned.

use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::{
    address::{Address, RelayHeader},
    codec::{verify_header_tag, ChunkOpener, ONETIMEAUTH_BYTES},
    config::{CipherProfile, Config},
    error::{BadDataReceived, Error, PeerMisbehaved},
    relay::splice,
    stream::ShadowStream,
    BUF_SIZE,
};

/// Matching mode of an [`AccessList`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AclMode {
    /// Listed peers are rejected; auth failures add peers to the list.
    BlackList,
    /// Only listed peers are accepted.
    WhiteList,
}

/// Minimal in-memory access-control list consulted by the server.
#[derive(Debug)]
pub struct AccessList {
    mode: AclMode,
    ips: Mutex<HashSet<IpAddr>>,
}

impl AccessList {
    /// An empty list with the given matching mode.
    pub fn new(mode: AclMode) -> Self {
        AccessList {
            mode,
            ips: Mutex::new(HashSet::new()),
        }
    }

    /// A list pre-populated with `ips`.
    pub fn with_ips(mode: AclMode, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        AccessList {
            mode,
            ips: Mutex::new(ips.into_iter().collect()),
        }
    }

    /// The matching mode.
    pub fn mode(&self) -> AclMode {
        self.mode
    }

    /// Whether `ip` is on the list.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ips.lock().unwrap().contains(&ip)
    }

    /// Adds `ip` to the list.
    pub fn add(&self, ip: IpAddr) {
        self.ips.lock().unwrap().insert(ip);
    }
}

/// The server deployment mode: accepts encrypted client connections and
/// relays them to the destinations named in their headers.
pub struct Server {
    profile: Arc<CipherProfile>,
    listener: TcpListener,
    acl: Option<Arc<AccessList>>,
}

impl Server {
    /// Binds the listening socket and derives the cipher profile.
    pub async fn bind(listen: SocketAddr, config: &Config) -> io::Result<Server> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Server {
            profile: Arc::new(CipherProfile::new(config)),
            listener,
            acl: None,
        })
    }

    /// Attaches an access-control list.
    pub fn with_acl(mut self, acl: Arc<AccessList>) -> Server {
        self.acl = Some(acl);
        self
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails. Each connection runs
    /// in its own task; per-connection failures never propagate here.
    pub async fn run(self) -> io::Result<()> {
        info!("listening on {}", self.local_addr()?);
        loop {
            let (socket, peer) = self.listener.accept().await?;
            if let Some(acl) = &self.acl {
                let rejected = match acl.mode() {
                    AclMode::BlackList => acl.contains(peer.ip()),
                    AclMode::WhiteList => !acl.contains(peer.ip()),
                };
                if rejected {
                    debug!("rejected {} by access list", peer);
                    continue;
                }
            }
            let _ = socket.set_nodelay(true);

            let profile = self.profile.clone();
            let acl = self.acl.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(profile, socket, peer).await {
                    report_failure(&e, peer, acl.as_deref());
                }
            });
        }
    }
}

struct Request {
    header: RelayHeader,
    first_payload: BytesMut,
}

async fn handle_connection(
    profile: Arc<CipherProfile>,
    socket: TcpStream,
    peer: SocketAddr,
) -> io::Result<()> {
    let idle_timeout = profile.idle_timeout();
    let auth_required = profile.one_time_auth();
    let mut stream = ShadowStream::with_profile_in(profile.clone(), socket);

    let request = match timeout(idle_timeout, read_request(&mut stream, &profile, auth_required))
        .await
    {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => {
            debug!("client {} closed before sending a header", peer);
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!("handshake timeout from {}", peer);
            return Ok(());
        }
    };

    debug!(
        "connect to {}:{} for {}",
        request.header.addr, request.header.port, peer
    );
    let mut upstream = match dial(&request.header.addr, request.header.port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            // Resolve and connect failures are self-contained.
            debug!(
                "failed to reach {}:{}: {}",
                request.header.addr, request.header.port, e
            );
            return Ok(());
        }
    };

    if !request.first_payload.is_empty() {
        upstream.write_all(&request.first_payload).await?;
    }

    let (uploaded, downloaded) = splice(stream, upstream, idle_timeout).await?;
    debug!(uploaded, downloaded, "relay for {} finished", peer);
    Ok(())
}

/// `WAIT_HEADER`: accumulates decrypted bytes until the header (plus the
/// auth tag when required) parses. Returns `None` on a clean early close.
async fn read_request(
    stream: &mut ShadowStream<TcpStream>,
    profile: &CipherProfile,
    auth_required: bool,
) -> io::Result<Option<Request>> {
    let mut hbuf = BytesMut::new();
    let mut scratch = [0u8; BUF_SIZE];

    let (header, consumed) = loop {
        match RelayHeader::parse(&hbuf)? {
            Some(parsed) => break parsed,
            None => {
                let n = stream.read(&mut scratch).await?;
                if n == 0 {
                    if hbuf.is_empty() {
                        return Ok(None);
                    }
                    return Err(PeerMisbehaved::TruncatedHeader.into());
                }
                hbuf.extend_from_slice(&scratch[..n]);
            }
        }
    };

    let auth = header.auth || auth_required;
    let mut offset = consumed;
    if auth {
        while hbuf.len() < consumed + ONETIMEAUTH_BYTES {
            let n = stream.read(&mut scratch).await?;
            if n == 0 {
                return Err(PeerMisbehaved::TruncatedHeader.into());
            }
            hbuf.extend_from_slice(&scratch[..n]);
        }
        let tag = &hbuf[consumed..consumed + ONETIMEAUTH_BYTES];
        if !verify_header_tag(stream.peer_iv(), profile.key(), &hbuf[..consumed], tag) {
            return Err(BadDataReceived::HeaderAuthFailed.into());
        }
        offset += ONETIMEAUTH_BYTES;
    }

    // Bytes past the header are the first upstream payload; with auth on
    // they must pass chunk verification like everything that follows.
    let residual = &hbuf[offset..];
    let mut first_payload = BytesMut::new();
    if auth {
        let mut opener = ChunkOpener::new(stream.peer_iv());
        opener.feed(residual, &mut first_payload)?;
        stream.set_read_auth(opener)?;
    } else {
        first_payload.extend_from_slice(residual);
    }

    Ok(Some(Request {
        header,
        first_payload,
    }))
}

/// `RESOLVING`/`CONNECTING`: literal IPs (including IP-shaped domains)
/// dial directly; everything else goes through the resolver first.
async fn dial(addr: &Address, port: u16) -> io::Result<TcpStream> {
    let stream = match addr.literal_ip() {
        Some(ip) => TcpStream::connect((ip, port)).await?,
        None => {
            let Address::Domain(name) = addr else {
                unreachable!("non-domain address always has a literal IP")
            };
            let mut resolved = lookup_host((name.as_str(), port)).await?;
            match resolved.next() {
                Some(dest) => TcpStream::connect(dest).await?,
                None => return Err(io::Error::new(ErrorKind::NotFound, "no address resolved")),
            }
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn report_failure(e: &io::Error, peer: SocketAddr, acl: Option<&AccessList>) {
    match Error::from_io(e) {
        // Replayed streams are rejected without telling anyone.
        Some(Error::BadDataReceived(BadDataReceived::ReusedIv)) => {
            debug!("duplicate IV from {}, dropping", peer);
        }
        Some(Error::BadDataReceived(BadDataReceived::DecryptFailed)) => {
            error!("invalid password or cipher from {}", peer);
        }
        Some(Error::BadDataReceived(reason)) => {
            error!("authentication error from {}: {}", peer, reason);
            if let Some(acl) = acl {
                if acl.mode() == AclMode::BlackList {
                    acl.add(peer.ip());
                    error!("add {} to the black list", peer.ip());
                }
            }
        }
        Some(Error::PeerMisbehaved(reason)) => {
            error!("failed to handshake with {}: {}", peer, reason);
        }
        None => {
            debug!("connection from {} closed: {}", peer, e);
        }
    }
}
