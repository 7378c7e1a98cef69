//! TLS 1.2 key schedule for the PSK suites (RFC 4279, RFC 5489, RFC 5246).

use std::sync::Arc;

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::aead::{AesGcmCipher, FIXED_IV_LEN, KEY_LEN};
use super::prf::prf_tls12;
use super::RecordCipher;
use crate::message::{Random, VERIFY_DATA_LEN};
use crate::Error;

pub type MasterSecret = Zeroizing<Vec<u8>>;

const MASTER_SECRET_LEN: usize = 48;

/// premaster = uint16 len || other_secret || uint16 len || psk
///
/// For plain PSK `other_secret` is a string of zeros as long as the psk.
pub fn premaster_secret(psk: &[u8], other_secret: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
    let zeros;
    let other = match other_secret {
        Some(o) => o,
        None => {
            zeros = vec![0u8; psk.len()];
            &zeros
        }
    };
    let mut out = Zeroizing::new(Vec::with_capacity(4 + other.len() + psk.len()));
    out.extend_from_slice(&(other.len() as u16).to_be_bytes());
    out.extend_from_slice(other);
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
    out
}

/// master_secret = PRF(pre_master_secret, "master secret", client_random + server_random)
pub fn master_secret(
    premaster: &[u8],
    client_random: &Random,
    server_random: &Random,
) -> Result<MasterSecret, Error> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(&client_random.to_bytes());
    seed.extend_from_slice(&server_random.to_bytes());
    prf_tls12(premaster, "master secret", &seed, MASTER_SECRET_LEN)
}

/// Key block split into the per direction keys and fixed IVs.
pub struct KeyBlock {
    material: Zeroizing<Vec<u8>>,
}

impl KeyBlock {
    /// key_block = PRF(master_secret, "key expansion", server_random + client_random)
    pub fn derive(
        master: &[u8],
        client_random: &Random,
        server_random: &Random,
    ) -> Result<KeyBlock, Error> {
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(&server_random.to_bytes());
        seed.extend_from_slice(&client_random.to_bytes());
        let material = prf_tls12(master, "key expansion", &seed, 2 * (KEY_LEN + FIXED_IV_LEN))?;
        Ok(KeyBlock { material })
    }

    fn client_cipher(&self) -> Result<AesGcmCipher, Error> {
        let key = &self.material[..KEY_LEN];
        let iv_start = 2 * KEY_LEN;
        AesGcmCipher::new(key, &self.material[iv_start..iv_start + FIXED_IV_LEN])
    }

    fn server_cipher(&self) -> Result<AesGcmCipher, Error> {
        let key = &self.material[KEY_LEN..2 * KEY_LEN];
        let iv_start = 2 * KEY_LEN + FIXED_IV_LEN;
        AesGcmCipher::new(key, &self.material[iv_start..iv_start + FIXED_IV_LEN])
    }

    /// (read, write) ciphers for the given side.
    pub fn ciphers(
        &self,
        is_client: bool,
    ) -> Result<(Arc<dyn RecordCipher>, Arc<dyn RecordCipher>), Error> {
        let client: Arc<dyn RecordCipher> = Arc::new(self.client_cipher()?);
        let server: Arc<dyn RecordCipher> = Arc::new(self.server_cipher()?);
        Ok(if is_client {
            (server, client)
        } else {
            (client, server)
        })
    }
}

/// verify_data = PRF(master_secret, finished_label, Hash(handshake_messages))[0..12]
pub fn finished_verify_data(
    master: &[u8],
    from_client: bool,
    transcript: &[u8],
) -> Result<[u8; VERIFY_DATA_LEN], Error> {
    let label = if from_client {
        "client finished"
    } else {
        "server finished"
    };
    let hash = Sha256::digest(transcript);
    let out = prf_tls12(master, label, &hash, VERIFY_DATA_LEN)?;
    let mut verify_data = [0u8; VERIFY_DATA_LEN];
    verify_data.copy_from_slice(&out);
    Ok(verify_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Aad;
    use crate::types::{ContentType, Sequence};

    #[test]
    fn psk_premaster_layout() {
        let pre = premaster_secret(&[1, 2, 3], None);
        assert_eq!(&pre[..], &[0, 3, 0, 0, 0, 0, 3, 1, 2, 3]);

        let pre = premaster_secret(&[9], Some(&[5, 5]));
        assert_eq!(&pre[..], &[0, 2, 5, 5, 0, 1, 9]);
    }

    #[test]
    fn both_sides_derive_matching_ciphers() {
        let cr = Random::new();
        let sr = Random::new();
        let pre = premaster_secret(b"secretPSK", None);
        let master = master_secret(&pre, &cr, &sr).unwrap();
        assert_eq!(master.len(), 48);

        let kb = KeyBlock::derive(&master, &cr, &sr).unwrap();
        let (client_read, client_write) = kb.ciphers(true).unwrap();
        let (server_read, server_write) = kb.ciphers(false).unwrap();

        let seq = Sequence::new(1);
        let aad = Aad::new(ContentType::ApplicationData, seq, 2);
        let frag = client_write.encrypt(seq, &aad, b"hi").unwrap();
        assert_eq!(server_read.decrypt(&aad, &frag).unwrap(), b"hi");
        assert!(client_read.decrypt(&aad, &frag).is_err());

        let frag = server_write.encrypt(seq, &aad, b"yo").unwrap();
        assert_eq!(client_read.decrypt(&aad, &frag).unwrap(), b"yo");
    }

    #[test]
    fn finished_labels_differ() {
        let master = [3u8; 48];
        let c = finished_verify_data(&master, true, b"transcript").unwrap();
        let s = finished_verify_data(&master, false, b"transcript").unwrap();
        assert_ne!(c, s);
    }
}
