use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

/// PRF for TLS 1.2
/// as specified in RFC 5246 Section 5, with SHA-256.
///
/// PRF(secret, label, seed) = P_<hash>(secret, label + seed)
///
/// NOTE: The seed parameter here is the actual seed data WITHOUT the label.
/// The label will be prepended to form the full seed used in the PRF calculation.
pub fn prf_tls12(
    secret: &[u8],
    label: &str,
    seed: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    debug_assert!(label.is_ascii());
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);

    p_hash(secret, &full_seed, output_len)
}

fn p_hash(secret: &[u8], full_seed: &[u8], output_len: usize) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut result = Zeroizing::new(Vec::with_capacity(output_len));

    let key = HmacSha256::new_from_slice(secret)
        .map_err(|_| Error::CryptoError("Invalid HMAC key".into()))?;

    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut mac = key.clone();
    mac.update(full_seed);
    let mut a = mac.finalize().into_bytes();

    while result.len() < output_len {
        // HMAC_hash(secret, A(i) + seed)
        let mut mac = key.clone();
        mac.update(&a);
        mac.update(full_seed);
        let output = mac.finalize().into_bytes();

        let remaining = output_len - result.len();
        let to_copy = std::cmp::min(remaining, output.len());
        result.extend_from_slice(&output[..to_copy]);

        if result.len() < output_len {
            // A(i+1) = HMAC_hash(secret, A(i))
            let mut mac = key.clone();
            mac.update(&a);
            a = mac.finalize().into_bytes();
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vector for TLS 1.2 PRF with SHA-256, published on the IETF TLS list
    // (https://mailarchive.ietf.org/arch/msg/tls/fzVCzk-z3FShgGJ6DOXqM1ydxms/).
    #[test]
    fn prf_sha256_vector() {
        let secret = [
            0x9b, 0xbe, 0x43, 0x6b, 0xa9, 0x40, 0xf0, 0x17, 0xb1, 0x76, 0x52, 0x84, 0x9a, 0x71,
            0xdb, 0x35,
        ];
        let seed = [
            0xa0, 0xba, 0x9f, 0x93, 0x6c, 0xda, 0x31, 0x18, 0x27, 0xa6, 0xf7, 0x96, 0xff, 0xd5,
            0x19, 0x8c,
        ];
        let out = prf_tls12(&secret, "test label", &seed, 100).unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(
            &out[..16],
            &[
                0xe3, 0xf2, 0x29, 0xba, 0x72, 0x7b, 0xe1, 0x7b, 0x8d, 0x12, 0x26, 0x20, 0x55, 0x7c,
                0xd4, 0x53
            ]
        );
    }

    #[test]
    fn prf_is_deterministic_and_label_bound() {
        let a = prf_tls12(b"secret", "master secret", b"seed", 48).unwrap();
        let b = prf_tls12(b"secret", "master secret", b"seed", 48).unwrap();
        let c = prf_tls12(b"secret", "key expansion", b"seed", 48).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }
}
