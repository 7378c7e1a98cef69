use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::message::{ClientHello, Cookie};
use crate::rng::SeededRng;
use crate::util::ct_eq;

type HmacSha256 = Hmac<Sha256>;

const SECRET_LEN: usize = 32;

/// Cookie length produced by [`CookieGenerator`]. Same as the HMAC output.
pub const COOKIE_LEN: usize = 32;

struct Secrets {
    current: Zeroizing<[u8; SECRET_LEN]>,
    previous: Option<Zeroizing<[u8; SECRET_LEN]>>,
    rotated_at: Instant,
}

/// Stateless HelloVerifyRequest cookies.
///
/// cookie = HMAC-SHA256(secret, peer address || ClientHello without cookie)
///
/// The secret is replaced once per `period`; a cookie made with the
/// previous secret still verifies.
pub struct CookieGenerator {
    period: Duration,
    rng: SeededRng,
    secrets: Mutex<Secrets>,
}

impl std::fmt::Debug for CookieGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieGenerator")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl CookieGenerator {
    pub fn new(period: Duration, rng: SeededRng) -> Self {
        let mut current = Zeroizing::new([0u8; SECRET_LEN]);
        rng.fill(&mut current[..]);
        CookieGenerator {
            period,
            rng,
            secrets: Mutex::new(Secrets {
                current,
                previous: None,
                rotated_at: Instant::now(),
            }),
        }
    }

    fn rotate_if_due(&self, secrets: &mut Secrets, now: Instant) {
        if now.duration_since(secrets.rotated_at) < self.period {
            return;
        }
        let mut next = Zeroizing::new([0u8; SECRET_LEN]);
        self.rng.fill(&mut next[..]);
        let old = std::mem::replace(&mut secrets.current, next);
        secrets.previous = Some(old);
        secrets.rotated_at = now;
        trace!("Cookie secret rotated");
    }

    fn compute(secret: &[u8], peer: SocketAddr, hello: &ClientHello) -> Cookie {
        // Key length is never rejected by HMAC.
        let mut mac = match HmacSha256::new_from_slice(secret) {
            Ok(m) => m,
            Err(_) => return Cookie::empty(),
        };
        match peer {
            SocketAddr::V4(a) => mac.update(&a.ip().octets()),
            SocketAddr::V6(a) => mac.update(&a.ip().octets()),
        }
        mac.update(&peer.port().to_be_bytes());
        let mut bound = Buf::new();
        hello.serialize_for_cookie(&mut bound);
        mac.update(&bound);
        let out = mac.finalize().into_bytes();
        Cookie::try_new(&out).unwrap_or_default()
    }

    /// Cookie for this peer and hello, using the current secret.
    pub fn generate(&self, peer: SocketAddr, hello: &ClientHello) -> Cookie {
        self.generate_at(peer, hello, Instant::now())
    }

    fn generate_at(&self, peer: SocketAddr, hello: &ClientHello, now: Instant) -> Cookie {
        let mut secrets = self.secrets.lock();
        self.rotate_if_due(&mut secrets, now);
        Self::compute(&secrets.current[..], peer, hello)
    }

    /// Whether the hello carries a cookie made by this generator for `peer`.
    pub fn verify(&self, peer: SocketAddr, hello: &ClientHello) -> bool {
        self.verify_at(peer, hello, Instant::now())
    }

    fn verify_at(&self, peer: SocketAddr, hello: &ClientHello, now: Instant) -> bool {
        if hello.cookie.is_empty() {
            return false;
        }
        let mut secrets = self.secrets.lock();
        self.rotate_if_due(&mut secrets, now);

        let expected = Self::compute(&secrets.current[..], peer, hello);
        if ct_eq(&expected, &hello.cookie) {
            return true;
        }
        match &secrets.previous {
            Some(prev) => {
                let expected = Self::compute(&prev[..], peer, hello);
                ct_eq(&expected, &hello.cookie)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherSuite;
    use crate::message::{Extensions, Random, SessionId};

    fn hello() -> ClientHello {
        ClientHello::new(
            Random::new(),
            SessionId::empty(),
            &[CipherSuite::PskAes128GcmSha256],
            Extensions::default(),
        )
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:5684".parse().unwrap()
    }

    #[test]
    fn cookie_verifies_for_same_peer_and_hello() {
        let gen = CookieGenerator::new(Duration::from_secs(60), SeededRng::new(Some(1)));
        let mut ch = hello();
        ch.cookie = gen.generate(peer(), &ch);
        assert_eq!(ch.cookie.len(), COOKIE_LEN);
        assert!(gen.verify(peer(), &ch));

        let other: SocketAddr = "10.0.0.1:5685".parse().unwrap();
        assert!(!gen.verify(other, &ch));
    }

    #[test]
    fn cookie_is_bound_to_hello() {
        let gen = CookieGenerator::new(Duration::from_secs(60), SeededRng::new(Some(1)));
        let ch = hello();
        let mut other = hello();
        other.cookie = gen.generate(peer(), &ch);
        assert!(!gen.verify(peer(), &other));
    }

    #[test]
    fn previous_secret_still_accepted() {
        let gen = CookieGenerator::new(Duration::from_secs(10), SeededRng::new(Some(2)));
        let start = Instant::now();
        let mut ch = hello();
        ch.cookie = gen.generate_at(peer(), &ch, start);

        // One rotation: previous secret still valid.
        assert!(gen.verify_at(peer(), &ch, start + Duration::from_secs(11)));
        // Two rotations: gone.
        assert!(!gen.verify_at(peer(), &ch, start + Duration::from_secs(22)));
    }

    #[test]
    fn empty_cookie_rejected() {
        let gen = CookieGenerator::new(Duration::from_secs(60), SeededRng::new(None));
        assert!(!gen.verify(peer(), &hello()));
    }
}
