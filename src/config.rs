//! Configuration for setting up a [`Server`], [`Tunnel`] or [`ShadowStream`].
//!
//! To build a config, you make three decisions in order:
//!
//! 1. Pick the shared passphrase both endpoints were provisioned with.
//! 2. Choose a cipher method [`CipherKind`]. Both endpoints must use the
//!    same method; otherwise they will not be able to communicate.
//! 3. Decide whether one-time authentication is required. When enabled,
//!    request headers carry a 10-byte HMAC tag and the request payload is
//!    chunk-authenticated.
//!
//! # Example
//!
//! ```
//! use sswire::{CipherKind, Config};
//!
//! let server_config = Config::builder_with_passphrase("correct horse")
//!     .with_cipher(CipherKind::Aes256Cfb)
//!     .no_auth();
//!
//! let tunnel_config = Config::builder_with_passphrase("correct horse")
//!     .with_cipher_name("aes-256-cfb")
//!     .with_one_time_auth();
//! ```
//!
//! [`Server`]: crate::Server
//! [`Tunnel`]: crate::Tunnel
//! [`ShadowStream`]: crate::ShadowStream
use std::time::Duration;

use crate::{
    crypto::{CipherCtx, CipherKind, MasterKey, TableCipher},
    error::Error,
    replay_cache::{ReplayCache, REPLAY_CACHE_CAPACITY},
};

/// Default idle timeout for spliced connections.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration shared by both deployment modes.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) passphrase: String,
    pub(crate) cipher_kind: CipherKind,
    pub(crate) one_time_auth: bool,
    pub(crate) idle_timeout: Duration,
}

impl Config {
    /// Sets up the shared passphrase.
    pub fn builder_with_passphrase(passphrase: impl Into<String>) -> ConfigBuilder<WantsCipher> {
        ConfigBuilder {
            state: WantsCipher {
                passphrase: passphrase.into(),
            },
        }
    }

    /// Overrides the idle timeout after which a spliced connection with no
    /// traffic in either direction is closed. Defaults to 60 seconds.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Config {
        self.idle_timeout = timeout;
        self
    }
}

/// A builder for creating a [`Config`] instance.
///
/// To get a [`ConfigBuilder`], use [`Config::builder_with_passphrase`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder<State> {
    state: State,
}

/// Config builder state where the caller must supply a cipher method.
#[derive(Clone, Debug)]
pub struct WantsCipher {
    passphrase: String,
}

/// Config builder state where the caller must decide on one-time auth.
#[derive(Clone, Debug)]
pub struct WantsAuth {
    passphrase: String,
    cipher_kind: CipherKind,
}

impl ConfigBuilder<WantsCipher> {
    /// Sets up the cipher method.
    pub fn with_cipher(self, cipher_kind: CipherKind) -> ConfigBuilder<WantsAuth> {
        ConfigBuilder {
            state: WantsAuth {
                passphrase: self.state.passphrase,
                cipher_kind,
            },
        }
    }

    /// Sets up the cipher method by its configuration name.
    ///
    /// Unknown names fall back to the legacy `table` method with a
    /// warning, for compatibility with shadowsocks-libev.
    pub fn with_cipher_name(self, name: &str) -> ConfigBuilder<WantsAuth> {
        self.with_cipher(CipherKind::from_name(name))
    }

    /// Use the default cipher method (AES-128-CFB) without one-time auth.
    pub fn with_default_cipher(self) -> Config {
        self.with_cipher(CipherKind::default()).no_auth()
    }
}

impl ConfigBuilder<WantsAuth> {
    /// Requires one-time authentication on every connection, whether or not
    /// the client sets the header flag.
    pub fn with_one_time_auth(self) -> Config {
        self.finish(true)
    }

    /// Does not require one-time authentication. The server still honors
    /// the header flag when a client sets it.
    pub fn no_auth(self) -> Config {
        self.finish(false)
    }

    fn finish(self, one_time_auth: bool) -> Config {
        Config {
            passphrase: self.state.passphrase,
            cipher_kind: self.state.cipher_kind,
            one_time_auth,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Everything derived from a [`Config`] once at startup, shared immutably
/// by every connection.
///
/// shadowsocks-libev keeps the key, IV length, method and seen-IV cache in
/// process globals; here they live together in one value passed by
/// reference into every connection.
#[derive(Debug)]
pub struct CipherProfile {
    cipher_kind: CipherKind,
    key: MasterKey,
    table: Option<TableCipher>,
    replay: ReplayCache,
    one_time_auth: bool,
    idle_timeout: Duration,
}

impl CipherProfile {
    /// Derives the master key (and, for the legacy method, the substitution
    /// tables) from the configuration.
    pub fn new(config: &Config) -> Self {
        let table = match config.cipher_kind {
            CipherKind::Table => Some(TableCipher::derive(&config.passphrase)),
            _ => None,
        };
        CipherProfile {
            cipher_kind: config.cipher_kind,
            key: MasterKey::derive(&config.passphrase, config.cipher_kind),
            table,
            replay: ReplayCache::with_capacity(REPLAY_CACHE_CAPACITY),
            one_time_auth: config.one_time_auth,
            idle_timeout: config.idle_timeout,
        }
    }

    /// The configured cipher method.
    pub fn cipher_kind(&self) -> CipherKind {
        self.cipher_kind
    }

    /// Per-connection IV length on the wire.
    pub fn iv_len(&self) -> usize {
        self.cipher_kind.iv_len()
    }

    /// Whether one-time auth is required regardless of the header flag.
    pub fn one_time_auth(&self) -> bool {
        self.one_time_auth
    }

    /// Idle timeout for spliced connections.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub(crate) fn key(&self) -> &MasterKey {
        &self.key
    }

    /// Builds the primitive state for one direction of a connection.
    pub(crate) fn make_ctx(&self, iv: &[u8], decrypt: bool) -> CipherCtx {
        CipherCtx::new(self.cipher_kind, &self.key, self.table.as_ref(), iv, decrypt)
    }

    /// Records an inbound IV, rejecting replays. Methods without an IV are
    /// exempt.
    pub(crate) fn register_iv(&self, iv: &[u8]) -> Result<(), Error> {
        if self.iv_len() == 0 {
            return Ok(());
        }
        self.replay.check_or_insert(iv)
    }
}

impl From<Config> for CipherProfile {
    fn from(config: Config) -> Self {
        CipherProfile::new(&config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{BadDataReceived, Error};

    #[test]
    fn test_builder_stages() {
        let config = Config::builder_with_passphrase("test")
            .with_cipher(CipherKind::Aes256Cfb)
            .with_one_time_auth();
        assert_eq!(config.cipher_kind, CipherKind::Aes256Cfb);
        assert!(config.one_time_auth);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);

        let config = Config::builder_with_passphrase("test").with_default_cipher();
        assert_eq!(config.cipher_kind, CipherKind::Aes128Cfb);
        assert!(!config.one_time_auth);
    }

    #[test]
    fn test_builder_by_name_falls_back() {
        let config = Config::builder_with_passphrase("test")
            .with_cipher_name("no-such-cipher")
            .no_auth();
        assert_eq!(config.cipher_kind, CipherKind::Table);
    }

    #[test]
    fn test_profile_replay_registration() {
        let config = Config::builder_with_passphrase("test")
            .with_cipher(CipherKind::Aes128Cfb)
            .no_auth();
        let profile = CipherProfile::new(&config);

        let iv = [9u8; 16];
        assert!(profile.register_iv(&iv).is_ok());
        assert_eq!(
            profile.register_iv(&iv),
            Err(Error::BadDataReceived(BadDataReceived::ReusedIv))
        );
    }

    #[test]
    fn test_profile_without_iv_skips_replay_cache() {
        let config = Config::builder_with_passphrase("test")
            .with_cipher(CipherKind::Rc4)
            .no_auth();
        let profile = CipherProfile::new(&config);
        assert!(profile.register_iv(&[]).is_ok());
        assert!(profile.register_iv(&[]).is_ok());
    }
}
