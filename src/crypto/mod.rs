//! Cryptographic capabilities consumed by the record layer and handshakers.
//!
//! Records are protected through the [`RecordCipher`] trait. The handshake
//! derives keys with the TLS 1.2 PRF and authenticates peers with pre-shared keys.

mod aead;
mod cookie;
mod keys;
mod kx;
mod prf;
mod psk;

pub use aead::{Aad, AesGcmCipher, RecordCipher};
pub use aead::{AEAD_OVERHEAD, EXPLICIT_NONCE_LEN, FIXED_IV_LEN, GCM_TAG_LEN, KEY_LEN};
pub use cookie::CookieGenerator;
pub use keys::{finished_verify_data, master_secret, premaster_secret, KeyBlock, MasterSecret};
pub use kx::EphemeralKeyExchange;
pub use prf::prf_tls12;
pub use psk::{PskStore, StaticPskStore};

use nom::number::complete::be_u16;
use nom::IResult;

/// The cipher suites this crate negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(non_camel_case_types)]
pub enum CipherSuite {
    /// TLS_PSK_WITH_AES_128_GCM_SHA256 (RFC 5487)
    PskAes128GcmSha256,
    /// TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256 (RFC 8442), x25519 only.
    EcdhePskAes128GcmSha256,
    Unknown(u16),
    #[default]
    Null,
}

/// How the premaster secret is agreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlgorithm {
    Psk,
    EcdhePsk,
}

impl CipherSuite {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x00A8 => CipherSuite::PskAes128GcmSha256,
            0xD001 => CipherSuite::EcdhePskAes128GcmSha256,
            0x0000 => CipherSuite::Null,
            _ => CipherSuite::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CipherSuite::PskAes128GcmSha256 => 0x00A8,
            CipherSuite::EcdhePskAes128GcmSha256 => 0xD001,
            CipherSuite::Unknown(value) => *value,
            CipherSuite::Null => 0x0000,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], CipherSuite> {
        let (input, value) = be_u16(input)?;
        Ok((input, Self::from_u16(value)))
    }

    pub fn is_supported(&self) -> bool {
        self.key_exchange().is_some()
    }

    pub fn key_exchange(&self) -> Option<KeyExchangeAlgorithm> {
        match self {
            CipherSuite::PskAes128GcmSha256 => Some(KeyExchangeAlgorithm::Psk),
            CipherSuite::EcdhePskAes128GcmSha256 => Some(KeyExchangeAlgorithm::EcdhePsk),
            CipherSuite::Unknown(_) | CipherSuite::Null => None,
        }
    }

    /// Every supported suite, in order of preference.
    pub fn all() -> &'static [CipherSuite] {
        &[
            CipherSuite::EcdhePskAes128GcmSha256,
            CipherSuite::PskAes128GcmSha256,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_codes() {
        assert_eq!(CipherSuite::from_u16(0x00A8), CipherSuite::PskAes128GcmSha256);
        assert_eq!(CipherSuite::EcdhePskAes128GcmSha256.as_u16(), 0xD001);
        assert!(!CipherSuite::Unknown(0xC02B).is_supported());
        assert!(CipherSuite::all().iter().all(|s| s.is_supported()));
    }
}
