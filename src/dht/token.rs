use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use sha1::{Digest, Sha1};

const TOKEN_LEN: usize = 8;

/// Secrets behind the write tokens we hand out in get_peers responses.
///
/// A token is `SHA1(secret || ip)` truncated; tokens made with the current
/// or the previous secret are accepted, so a token stays valid for one to
/// two rotation periods.
pub struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }

    pub fn generate(&self, addr: &SocketAddr) -> Bytes {
        token_for(&self.current, addr.ip())
    }

    pub fn validate(&self, addr: &SocketAddr, token: &[u8]) -> bool {
        let ip = addr.ip();
        token_for(&self.current, ip) == token || token_for(&self.previous, ip) == token
    }
}

impl Default for TokenSecrets {
    fn default() -> Self {
        Self::new()
    }
}

fn token_for(secret: &[u8; 16], ip: IpAddr) -> Bytes {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    Bytes::copy_from_slice(&hasher.finalize()[..TOKEN_LEN])
}
