use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Key, Nonce};

use crate::buffer::Buf;
use crate::message::ConnectionId;
use crate::types::{ContentType, ProtocolVersion, Sequence};
use crate::Error;

/// AES-128 key length.
pub const KEY_LEN: usize = 16;

/// Fixed (implicit) part of the AEAD nonce, from the key block.
pub const FIXED_IV_LEN: usize = 4;

/// Explicit nonce length for DTLS AEAD records.
///
/// The explicit nonce is transmitted with each record.
pub const EXPLICIT_NONCE_LEN: usize = 8;

/// GCM authentication tag length.
pub const GCM_TAG_LEN: usize = 16;

/// Overhead per AEAD record (explicit nonce + tag).
pub const AEAD_OVERHEAD: usize = EXPLICIT_NONCE_LEN + GCM_TAG_LEN;

/// Record protection for one direction of one epoch.
///
/// Implementations must be safe to use from any thread; no per-thread
/// instance caching is needed.
pub trait RecordCipher: Send + Sync + fmt::Debug {
    /// Encrypt `plaintext`, returning the record fragment (explicit nonce, ciphertext, tag).
    fn encrypt(&self, sequence: Sequence, aad: &Aad, plaintext: &[u8]) -> Result<Vec<u8>, Error>;

    /// Decrypt a record fragment produced by `encrypt`.
    ///
    /// Every failure is reported as [`Error::DecryptError`].
    fn decrypt(&self, aad: &Aad, fragment: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Additional Authenticated Data for DTLS 1.2 records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aad(pub Buf);

impl Aad {
    /// Create AAD for a record without connection id (RFC 5246 6.2.3.3).
    pub fn new(content_type: ContentType, sequence: Sequence, length: u16) -> Self {
        let mut aad = Buf::with_capacity(13);
        aad.extend_from_slice(&sequence.to_bytes());
        aad.push(content_type.as_u8());
        ProtocolVersion::DTLS1_2.serialize(&mut aad);
        aad.push_u16(length);
        Aad(aad)
    }

    /// Create AAD for a `tls12_cid` record (RFC 9146 section 5).
    pub fn new_cid(sequence: Sequence, cid: &ConnectionId, length: u16) -> Self {
        let tls12_cid = ContentType::Tls12Cid.as_u8();
        let mut aad = Buf::with_capacity(23 + cid.len());
        aad.extend_from_slice(&[0xff; 8]);
        aad.push(tls12_cid);
        aad.push(cid.len() as u8);
        aad.push(tls12_cid);
        ProtocolVersion::DTLS1_2.serialize(&mut aad);
        aad.extend_from_slice(&sequence.to_bytes());
        aad.extend_from_slice(cid);
        aad.push_u16(length);
        Aad(aad)
    }
}

/// AES-128-GCM as used by both supported suites.
pub struct AesGcmCipher {
    cipher: Aes128Gcm,
    fixed_iv: [u8; FIXED_IV_LEN],
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    pub fn new(key: &[u8], fixed_iv: &[u8]) -> Result<Self, Error> {
        if key.len() != KEY_LEN || fixed_iv.len() != FIXED_IV_LEN {
            return Err(Error::CryptoError(format!(
                "Invalid key/iv size for AES-128-GCM: {}/{}",
                key.len(),
                fixed_iv.len()
            )));
        }
        let key = Key::<Aes128Gcm>::from_slice(key);
        let mut iv = [0u8; FIXED_IV_LEN];
        iv.copy_from_slice(fixed_iv);
        Ok(AesGcmCipher {
            cipher: Aes128Gcm::new(key),
            fixed_iv: iv,
        })
    }

    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..FIXED_IV_LEN].copy_from_slice(&self.fixed_iv);
        nonce[FIXED_IV_LEN..].copy_from_slice(explicit);
        nonce
    }
}

impl RecordCipher for AesGcmCipher {
    fn encrypt(&self, sequence: Sequence, aad: &Aad, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let explicit = sequence.to_bytes();
        let nonce = self.nonce(&explicit);
        let payload = Payload {
            msg: plaintext,
            aad: &aad.0,
        };
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| Error::CryptoError("AES-GCM encryption failed".into()))?;

        let mut fragment = Vec::with_capacity(EXPLICIT_NONCE_LEN + ciphertext.len());
        fragment.extend_from_slice(&explicit);
        fragment.extend_from_slice(&ciphertext);
        Ok(fragment)
    }

    fn decrypt(&self, aad: &Aad, fragment: &[u8]) -> Result<Vec<u8>, Error> {
        if fragment.len() < AEAD_OVERHEAD {
            return Err(Error::DecryptError);
        }
        let (explicit, ciphertext) = fragment.split_at(EXPLICIT_NONCE_LEN);
        let nonce = self.nonce(explicit);
        let payload = Payload {
            msg: ciphertext,
            aad: &aad.0,
        };
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| Error::DecryptError)
    }
}
