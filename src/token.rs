//! Announce tokens.
//!
//! A token binds a prior `get_peers` exchange to a later `announce_peer`
//! from the same address. Instead of remembering every token we hand out,
//! we keep two rotating secrets and recompute: a presented token is valid
//! if it matches the HMAC of the presenting address under the current or
//! the previous secret. Secrets rotate every five minutes (lazily, on use),
//! so a token stays valid for five to ten minutes.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::convert::TryInto;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::id::LengthError;

type HmacSha1 = Hmac<Sha1>;

/// How often the signing secret rotates.
const ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const SECRET_LEN: usize = 20;

/// Length of an issued token in bytes.
pub(crate) const TOKEN_LEN: usize = 20;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Token {
    bytes: [u8; TOKEN_LEN],
}

impl Token {
    pub fn new(bytes: &[u8]) -> Result<Self, LengthError> {
        Ok(Self {
            bytes: bytes.try_into().map_err(|_| LengthError)?,
        })
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

// ----------------------------------------------------------------------------//

/// Issues and verifies short-lived announce tokens.
pub(crate) struct TokenAuthority {
    curr_secret: [u8; SECRET_LEN],
    prev_secret: [u8; SECRET_LEN],
    last_rotate: Instant,
}

impl TokenAuthority {
    pub fn new() -> TokenAuthority {
        // The previous secret starts out random as well; a placeholder
        // would let anyone announce to a freshly started node.
        TokenAuthority {
            curr_secret: random_secret(),
            prev_secret: random_secret(),
            last_rotate: Instant::now(),
        }
    }

    /// Issue a token for the given address under the current secret.
    pub fn issue(&mut self, addr: SocketAddrV4) -> Token {
        self.rotate_check();

        derive_token(&self.curr_secret, addr)
    }

    /// Check a presented token against the given address. Accepts tokens
    /// issued under the current or the previous secret.
    pub fn verify(&mut self, addr: SocketAddrV4, token: Token) -> bool {
        self.rotate_check();

        derive_token(&self.curr_secret, addr) == token
            || derive_token(&self.prev_secret, addr) == token
    }

    /// Rotate the secrets if the interval has passed. More than one missed
    /// interval invalidates both secrets.
    fn rotate_check(&mut self) {
        match intervals_passed(self.last_rotate) {
            0 => (),
            1 => {
                self.prev_secret = self.curr_secret;
                self.curr_secret = random_secret();
                self.last_rotate = Instant::now();
            }
            _ => {
                self.prev_secret = random_secret();
                self.curr_secret = random_secret();
                self.last_rotate = Instant::now();
            }
        }
    }
}

fn intervals_passed(last_rotate: Instant) -> u64 {
    let elapsed = Instant::now().saturating_duration_since(last_rotate);

    elapsed.as_secs() / ROTATE_INTERVAL.as_secs()
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

/// HMAC-SHA1 of the address (ip then port, big-endian) under the secret.
fn derive_token(secret: &[u8; SECRET_LEN], addr: SocketAddrV4) -> Token {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC key of any length");
    mac.update(&addr.ip().octets());
    mac.update(&addr.port().to_be_bytes());

    let digest: [u8; TOKEN_LEN] = mac.finalize().into_bytes().into();
    Token { bytes: digest }
}
