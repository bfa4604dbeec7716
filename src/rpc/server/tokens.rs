//! Manage tokens for remote client addresses.

use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;
use sha1_smol::Sha1;

const SECRET_SIZE: usize = 16;
/// Length of the time window a token is issued for, in seconds.
pub const TOKEN_WINDOW_SECS: u64 = 300;

/// Tokens generator.
///
/// A token is `SHA1(address || window || secret)` where `window` is the unix time
/// divided by [TOKEN_WINDOW_SECS]. Tokens from the current or the previous window
/// are accepted, so a token lives between 5 and 10 minutes.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
#[derive(Clone)]
pub struct Tokens {
    secret: [u8; SECRET_SIZE],
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    /// Create a Tokens generator with a fresh random secret.
    pub fn new() -> Self {
        let mut secret = [0_u8; SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);

        Tokens { secret }
    }

    // === Public Methods ===

    /// Generates a token for a remote peer in the current window.
    pub fn generate_token(&self, address: SocketAddrV4) -> [u8; 20] {
        self.generate_token_at(address, unix_now())
    }

    /// Validate that the token was generated for this address within the current
    /// or the previous window.
    pub fn validate(&self, address: SocketAddrV4, token: &[u8]) -> bool {
        self.validate_at(address, token, unix_now())
    }

    /// Same as [Self::generate_token] at `unix_secs`.
    pub fn generate_token_at(&self, address: SocketAddrV4, unix_secs: u64) -> [u8; 20] {
        self.token_for_window(address, unix_secs / TOKEN_WINDOW_SECS)
    }

    /// Same as [Self::validate] at `unix_secs`.
    pub fn validate_at(&self, address: SocketAddrV4, token: &[u8], unix_secs: u64) -> bool {
        let window = unix_secs / TOKEN_WINDOW_SECS;

        if token == self.token_for_window(address, window) {
            return true;
        }

        window > 0 && token == self.token_for_window(address, window - 1)
    }

    // === Private Methods ===

    fn token_for_window(&self, address: SocketAddrV4, window: u64) -> [u8; 20] {
        let mut digest = Sha1::new();

        digest.update(address.to_string().as_bytes());
        digest.update(&window.to_be_bytes());
        digest.update(&self.secret);

        digest.digest().bytes()
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
