//! Key derivation and challenge encryption.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use sha1::Sha1;

use zx_core::{ZxError, ZxResult};

const SALT: &[u8] = b"ltsa";
const ROUNDS: u32 = 1000;
pub const KEY_LEN: usize = 32;
pub const CHALLENGE_LEN: usize = 16;

const IV: [u8; 16] = [
    0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f, 0x10, 0x11,
];

/// Shared key for a secret.
pub fn derive_key(secret: &str) -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(secret.as_bytes(), SALT, ROUNDS, &mut key);
    key
}

/// Response for a challenge: AES-256-CBC with PKCS#7 padding.
pub fn encrypt(key: &[u8], challenge: &[u8]) -> ZxResult<Vec<u8>> {
    let enc = cbc::Encryptor::<Aes256>::new_from_slices(key, &IV)
        .map_err(|_| ZxError::auth("encrypt failed: bad key"))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(challenge))
}

pub fn challenge() -> [u8; CHALLENGE_LEN] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key() {
        let k = derive_key("secret");
        assert_eq!(k.len(), KEY_LEN);
        assert_eq!(k, derive_key("secret"));
        assert_ne!(k, derive_key("other"));
    }

    #[test]
    fn test_encrypt_pads_to_blocks() {
        let k = derive_key("secret");
        let ch = [7u8; CHALLENGE_LEN];
        let r = encrypt(&k, &ch).unwrap();
        // a full block of padding follows an aligned challenge
        assert_eq!(r.len(), 32);
        assert_eq!(r, encrypt(&k, &ch).unwrap());
        assert_ne!(r, encrypt(&derive_key("other"), &ch).unwrap());
        assert!(encrypt(&k[..10], &ch).is_err());
    }
}
