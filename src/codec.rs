//! Stateful encryption and decryption of relay payload bytes, plus the
//! optional one-time authentication of headers and payload chunks.
//!
//! Every TCP stream begins with `iv_len` random bytes followed by
//! ciphertext; there is no length delimiter at the stream level. The
//! encryptor prepends its IV on first use, the decryptor consumes the
//! peer's IV on first use and rejects replays.
//!
//! Authenticated payload chunks (request direction only):
//!
//! ```text
//! +--------+----------+-------------+
//! | LEN_be | HMAC/10  | DATA        |
//! +--------+----------+-------------+
//! |   2B   |   10B    | LEN bytes   |
//! ```
//!
//! The chunk tag is keyed by `iv ‖ counter_be32`; the counter starts at 0
//! and increments per chunk, which enforces in-order delivery.

use std::sync::Arc;

use bytes::BytesMut;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, TryRngCore};
use sha1::Sha1;

use crate::{
    config::CipherProfile,
    crypto::{CipherCtx, MasterKey},
    error::{BadDataReceived, Error, PeerMisbehaved},
    BUF_SIZE,
};

type HmacSha1 = Hmac<Sha1>;

/// Length of the truncated HMAC-SHA1 tag on headers and chunks.
pub(crate) const ONETIMEAUTH_BYTES: usize = 10;
/// Length of the big-endian chunk length field.
pub(crate) const CLEN_BYTES: usize = 2;
/// Framing overhead of one authenticated chunk.
pub(crate) const AUTH_BYTES: usize = CLEN_BYTES + ONETIMEAUTH_BYTES;

/// Upper bound on a single chunk's `LEN` field. The wire format allows up
/// to `u16::MAX`, but accepting that would let a peer force an oversized
/// reassembly allocation.
pub(crate) const MAX_CHUNK_LEN: usize = BUF_SIZE;

/// Encrypting half of one connection.
pub(crate) struct StreamEncryptor {
    profile: Arc<CipherProfile>,
    iv: Vec<u8>,
    ctx: Option<CipherCtx>,
}

impl StreamEncryptor {
    /// The IV is generated eagerly so callers can compute header tags
    /// before the first write puts it on the wire.
    pub(crate) fn new(profile: Arc<CipherProfile>) -> Self {
        let mut iv = vec![0u8; profile.iv_len()];
        OsRng
            .try_fill_bytes(&mut iv)
            .expect("system random source failure");
        StreamEncryptor {
            profile,
            iv,
            ctx: None,
        }
    }

    /// The IV this direction will send (empty for methods without one).
    pub(crate) fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Encrypts `plain` and appends the wire bytes to `wire`. The first
    /// call prepends the IV.
    pub(crate) fn encrypt_into(&mut self, plain: &[u8], wire: &mut Vec<u8>) -> Result<(), Error> {
        if self.ctx.is_none() {
            wire.extend_from_slice(&self.iv);
            self.ctx = Some(self.profile.make_ctx(&self.iv, false));
        }
        let start = wire.len();
        wire.extend_from_slice(plain);
        self.ctx
            .as_mut()
            .expect("initialized above")
            .apply(&mut wire[start..])
    }
}

/// Decrypting half of one connection.
pub(crate) struct StreamDecryptor {
    profile: Arc<CipherProfile>,
    iv: Vec<u8>,
    ctx: Option<CipherCtx>,
}

impl StreamDecryptor {
    pub(crate) fn new(profile: Arc<CipherProfile>) -> Self {
        // Methods without an IV have nothing to wait for.
        let ctx = if profile.iv_len() == 0 {
            Some(profile.make_ctx(&[], true))
        } else {
            None
        };
        StreamDecryptor {
            profile,
            iv: Vec::new(),
            ctx,
        }
    }

    /// Whether the leading IV still has to be consumed from the wire.
    pub(crate) fn needs_iv(&self) -> bool {
        self.ctx.is_none()
    }

    pub(crate) fn iv_len(&self) -> usize {
        self.profile.iv_len()
    }

    /// The IV parsed from the wire. Empty until the first
    /// [`take_iv`](Self::take_iv) (and for methods without an IV).
    pub(crate) fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Consumes the IV from the front of the inbound stream. An IV seen
    /// before under this master key fails the connection.
    pub(crate) fn take_iv(&mut self, iv: &[u8]) -> Result<(), Error> {
        debug_assert!(self.ctx.is_none());
        debug_assert_eq!(iv.len(), self.iv_len());
        self.profile.register_iv(iv)?;
        self.iv = iv.to_vec();
        self.ctx = Some(self.profile.make_ctx(iv, true));
        Ok(())
    }

    /// Decrypts ciphertext in place. The IV must have been consumed first.
    pub(crate) fn decrypt(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.ctx
            .as_mut()
            .expect("IV must be consumed before decrypting")
            .apply(buf)
    }
}

/// Stateless one-shot encryption: a fresh IV every call, no stream state
/// carried over. This is the datagram-style variant of the codec.
pub fn encrypt_all(profile: &CipherProfile, plain: &[u8]) -> Vec<u8> {
    let mut iv = vec![0u8; profile.iv_len()];
    OsRng
        .try_fill_bytes(&mut iv)
        .expect("system random source failure");
    let mut ctx = profile.make_ctx(&iv, false);
    let mut wire = Vec::with_capacity(iv.len() + plain.len());
    wire.extend_from_slice(&iv);
    let start = wire.len();
    wire.extend_from_slice(plain);
    ctx.apply(&mut wire[start..])
        .expect("fresh keystream cannot be exhausted");
    wire
}

/// Stateless one-shot decryption. Consumes the leading IV; the replay
/// cache is deliberately not consulted on this path.
pub fn decrypt_all(profile: &CipherProfile, wire: &[u8]) -> Result<Vec<u8>, Error> {
    let iv_len = profile.iv_len();
    if wire.len() < iv_len {
        return Err(PeerMisbehaved::TruncatedHeader.into());
    }
    let (iv, body) = wire.split_at(iv_len);
    let mut ctx = profile.make_ctx(iv, true);
    let mut plain = body.to_vec();
    ctx.apply(&mut plain)?;
    Ok(plain)
}

/// Computes the one-time-auth tag over the request header, keyed by
/// `iv ‖ master_key`.
pub(crate) fn header_tag(iv: &[u8], key: &MasterKey, header: &[u8]) -> [u8; ONETIMEAUTH_BYTES] {
    let mut mac = HmacSha1::new_from_slice(&[iv, key.as_bytes()].concat())
        .expect("HMAC accepts any key length");
    mac.update(header);
    let full = mac.finalize().into_bytes();
    full[..ONETIMEAUTH_BYTES]
        .try_into()
        .expect("HMAC-SHA1 output is 20 bytes")
}

/// Verifies a truncated header tag in constant time. Equality only; there
/// is no ordering to be derived from the comparison.
pub(crate) fn verify_header_tag(iv: &[u8], key: &MasterKey, header: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha1::new_from_slice(&[iv, key.as_bytes()].concat())
        .expect("HMAC accepts any key length");
    mac.update(header);
    mac.verify_truncated_left(tag).is_ok()
}

fn chunk_mac(iv: &[u8], counter: u32) -> HmacSha1 {
    let mut mac_key = Vec::with_capacity(iv.len() + 4);
    mac_key.extend_from_slice(iv);
    mac_key.extend_from_slice(&counter.to_be_bytes());
    HmacSha1::new_from_slice(&mac_key).expect("HMAC accepts any key length")
}

fn chunk_tag(iv: &[u8], counter: u32, payload: &[u8]) -> [u8; ONETIMEAUTH_BYTES] {
    let mut mac = chunk_mac(iv, counter);
    mac.update(payload);
    let full = mac.finalize().into_bytes();
    full[..ONETIMEAUTH_BYTES]
        .try_into()
        .expect("HMAC-SHA1 output is 20 bytes")
}

fn verify_chunk_tag(iv: &[u8], counter: u32, payload: &[u8], tag: &[u8]) -> bool {
    let mut mac = chunk_mac(iv, counter);
    mac.update(payload);
    mac.verify_truncated_left(tag).is_ok()
}

/// Frames request-direction payload into authenticated chunks.
pub(crate) struct ChunkSealer {
    iv: Vec<u8>,
    counter: u32,
}

impl ChunkSealer {
    /// `iv` is the IV of the encrypting direction the chunks travel in.
    pub(crate) fn new(iv: &[u8]) -> Self {
        ChunkSealer {
            iv: iv.to_vec(),
            counter: 0,
        }
    }

    /// Produces `LEN ‖ TAG ‖ DATA` for one payload and advances the
    /// counter.
    pub(crate) fn seal(&mut self, payload: &[u8]) -> Vec<u8> {
        debug_assert!(payload.len() <= MAX_CHUNK_LEN);
        let tag = chunk_tag(&self.iv, self.counter, payload);
        let mut framed = Vec::with_capacity(AUTH_BYTES + payload.len());
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(&tag);
        framed.extend_from_slice(payload);
        self.counter = self.counter.wrapping_add(1);
        framed
    }
}

/// Incremental reassembler and verifier for authenticated chunks.
///
/// Bytes may arrive at arbitrary split points; completed chunks are
/// verified in counter order and their payload appended to the caller's
/// buffer. A tag mismatch (including reordered chunks) fails the
/// connection.
pub(crate) struct ChunkOpener {
    iv: Vec<u8>,
    counter: u32,
    partial: BytesMut,
    expected: Option<usize>,
}

impl ChunkOpener {
    /// `iv` is the IV of the decrypting direction the chunks arrive on.
    pub(crate) fn new(iv: &[u8]) -> Self {
        ChunkOpener {
            iv: iv.to_vec(),
            counter: 0,
            partial: BytesMut::new(),
            expected: None,
        }
    }

    /// Feeds decrypted bytes, appending verified payload to `out`.
    pub(crate) fn feed(&mut self, data: &[u8], out: &mut BytesMut) -> Result<(), Error> {
        self.partial.extend_from_slice(data);
        loop {
            let expected = match self.expected {
                Some(len) => len,
                None => {
                    if self.partial.len() < CLEN_BYTES {
                        return Ok(());
                    }
                    let len = u16::from_be_bytes([self.partial[0], self.partial[1]]);
                    if usize::from(len) > MAX_CHUNK_LEN {
                        return Err(PeerMisbehaved::OversizedChunk { received: len }.into());
                    }
                    self.expected = Some(usize::from(len));
                    usize::from(len)
                }
            };

            if self.partial.len() < AUTH_BYTES + expected {
                return Ok(());
            }

            let tag = &self.partial[CLEN_BYTES..AUTH_BYTES];
            let payload = &self.partial[AUTH_BYTES..AUTH_BYTES + expected];
            if !verify_chunk_tag(&self.iv, self.counter, payload, tag) {
                return Err(BadDataReceived::ChunkAuthFailed.into());
            }
            out.extend_from_slice(payload);

            let _ = self.partial.split_to(AUTH_BYTES + expected);
            self.expected = None;
            self.counter = self.counter.wrapping_add(1);
        }
    }
}
