//! Sswire is the core relay engine of a Shadowsocks-compatible encrypted
//! TCP tunnel: a SOCKS-style proxy protocol in which each client
//! connection is encrypted with a shared-secret symmetric cipher, carries
//! a destination address header, and is spliced bidirectionally to an
//! upstream TCP endpoint.
//!
//! ## Deployment modes
//!
//! * [`Server`]
//!
//!   Accepts encrypted connections, decrypts the request header, dials the
//!   named host and splices both directions until either side closes or
//!   the idle timer fires. Optionally consults an [`AccessList`] and
//!   auto-bans peers that present tampered authentication tags.
//!
//! * [`Tunnel`]
//!
//!   Accepts plaintext connections on a local port, prepends the fixed
//!   destination header it was configured with, encrypts, and splices to
//!   the remote server.
//!
//! Both are thin drivers around [`ShadowStream`], an [`AsyncRead`] +
//! [`AsyncWrite`] wrapper that applies the stream cipher per direction:
//! the first write puts a fresh random IV on the wire, the first read
//! consumes the peer's IV and rejects replays of recently seen IVs.
//!
//! ## Ciphers
//!
//! The supported methods, their key/IV sizes and their state families are
//! listed in [`CipherKind`]; the master key is derived from the passphrase
//! with the OpenSSL-compatible MD5 scheme (`EVP_BytesToKey`), so endpoints
//! interoperate with existing shadowsocks deployments. Unknown cipher
//! names fall back to the legacy `table` method.
//!
//! ## One-time authentication
//!
//! When enabled in the [`Config`] (or requested per connection by the
//! client's header flag), request headers carry a truncated HMAC-SHA1 tag
//! keyed by `IV ‖ master_key`, and request payload travels in
//! length-prefixed chunks tagged under `IV ‖ counter`, which forces
//! in-order delivery. There is no AEAD mode and no forward secrecy; replay
//! protection is best-effort via a bounded IV cache.
//!
//! ## Quick start
//!
//! ```no_run
//! use sswire::{CipherKind, Config, Server};
//!
//! # async fn run() -> std::io::Result<()> {
//! let config = Config::builder_with_passphrase("correct horse")
//!     .with_cipher(CipherKind::Aes256Cfb)
//!     .no_auth();
//!
//! let server = Server::bind("0.0.0.0:8388".parse().unwrap(), &config).await?;
//! server.run().await
//! # }
//! ```
//!
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
#![warn(missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod address;
mod codec;
mod crypto;
mod relay;
mod replay_cache;
mod server;
mod stream;
mod tunnel;

pub use address::{Address, RelayHeader};
pub use codec::{decrypt_all, encrypt_all};
pub use config::{CipherProfile, Config};
pub use crypto::{CipherFamily, CipherKind, MasterKey};
pub use error::Error;
pub use server::{AccessList, AclMode, Server};
pub use stream::ShadowStream;
pub use tunnel::Tunnel;

/// Per-direction relay buffer size, which also bounds the `LEN` field of
/// authenticated payload chunks.
pub(crate) const BUF_SIZE: usize = 32 * 1024;
