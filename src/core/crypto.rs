//! AES packet encryption and ECDH key agreement for Key-based Pairing

use aes::{
    Aes128,
    cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use p256::{PublicKey, SecretKey, ecdh::diffie_hellman, elliptic_curve::sec1::ToEncodedPoint};
use rand::{RngCore, rngs::OsRng};
use tracing::{debug, warn};

use crate::core::error::{CryptoError, CryptoResult};

/// Size of a raw X‖Y public key as exchanged over the air
pub const PUBLIC_KEY_LEN: usize = 64;

/// Message type of a Key-based Pairing request
pub const KBP_REQUEST_TYPE: u8 = 0x00;

/// Flags byte: seeker initiates, no bonding requested
pub const KBP_REQUEST_FLAGS: u8 = 0x00;

/// Encrypt one 16-byte block with AES-128 in ECB mode
pub fn encrypt_packet(plaintext: &[u8; 16], key: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut block = GenericArray::clone_from_slice(plaintext);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// Six address bytes from colon-delimited (or bare) hex text
///
/// Colons are skipped wherever they appear; each remaining character pair is one
/// byte, high nibble first. Non-hex characters count as zero.
pub fn address_bytes(text: &str) -> [u8; 6] {
    let mut out = [0u8; 6];
    let mut nibbles = text
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_digit(16).unwrap_or(0) as u8);

    for byte in out.iter_mut() {
        let Some(high) = nibbles.next() else { break };
        let low = nibbles.next().unwrap_or(0);
        *byte = (high << 4) | low;
    }
    out
}

/// Plaintext Key-based Pairing request: `[type][flags][address:6][salt:8]`
pub fn build_request(address_text: &str, salt: [u8; 8]) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[0] = KBP_REQUEST_TYPE;
    raw[1] = KBP_REQUEST_FLAGS;
    raw[2..8].copy_from_slice(&address_bytes(address_text));
    raw[8..16].copy_from_slice(&salt);
    raw
}

/// Fresh random salt for one request
pub fn random_salt() -> [u8; 8] {
    rand::random()
}

/// Ephemeral secp256r1 key pair
pub struct EcdhKeyPair {
    secret: SecretKey,
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Our public point as raw X‖Y (without the 0x04 prefix)
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    /// 32-byte ECDH shared secret with a raw X‖Y peer point
    pub fn shared_secret(&self, peer: &[u8]) -> CryptoResult<[u8; 32]> {
        if peer.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                actual: peer.len(),
            });
        }

        let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(peer);

        let peer = PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPeerKey)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

/// Derive the 16-byte AES key for a handshake
///
/// With a usable peer key this is the first half of the ECDH shared secret. Without
/// one, or when the point is rejected, random key material is substituted so the
/// probe can still check whether the peer authenticates the request at all.
pub fn derive_shared_key(peer_public_key: Option<&[u8]>) -> [u8; 16] {
    let local = EcdhKeyPair::generate();
    let mut key = [0u8; 16];

    match peer_public_key.map(|peer| local.shared_secret(peer)) {
        Some(Ok(secret)) => {
            debug!("Derived AES key from ECDH shared secret");
            key.copy_from_slice(&secret[..16]);
        }
        Some(Err(e)) => {
            warn!("ECDH failed ({}), using random key material", e);
            OsRng.fill_bytes(&mut key);
        }
        None => {
            debug!("No peer public key, using random key material");
            OsRng.fill_bytes(&mut key);
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_known_answer() {
        // FIPS-197 appendix C.1
        let key: [u8; 16] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let plaintext: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();

        let ciphertext = encrypt_packet(&plaintext, &key);
        assert_eq!(hex::encode(ciphertext), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn test_address_bytes() {
        let expected = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        assert_eq!(address_bytes("AA:BB:CC:DD:EE:FF"), expected);
        assert_eq!(address_bytes("aa:bb:cc:dd:ee:ff"), expected);
        assert_eq!(address_bytes("AABBCCDDEEFF"), expected);
        assert_eq!(address_bytes("A:AB:BCCD:D:EEFF"), expected);
    }

    #[test]
    fn test_build_request_layout() {
        let salt = [1, 2, 3, 4, 5, 6, 7, 8];
        let raw = build_request("11:22:33:44:55:66", salt);

        assert_eq!(raw[0], KBP_REQUEST_TYPE);
        assert_eq!(raw[1], KBP_REQUEST_FLAGS);
        assert_eq!(&raw[2..8], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(&raw[8..], &salt);
    }

    #[test]
    fn test_ecdh_agreement() {
        let alice = EcdhKeyPair::generate();
        let bob = EcdhKeyPair::generate();

        let ab = alice.shared_secret(&bob.public_key()).unwrap();
        let ba = bob.shared_secret(&alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_ecdh_rejects_invalid_point() {
        let local = EcdhKeyPair::generate();

        assert_eq!(
            local.shared_secret(&[0u8; 10]),
            Err(CryptoError::InvalidKeyLength {
                expected: 64,
                actual: 10
            })
        );
        assert_eq!(
            local.shared_secret(&[0xFFu8; 64]),
            Err(CryptoError::InvalidPeerKey)
        );
    }

    #[test]
    fn test_derive_shared_key_falls_back() {
        // Both paths must still produce key material
        let a = derive_shared_key(None);
        let b = derive_shared_key(Some(&[0xFFu8; 64][..]));
        assert_ne!(a, b);

        let peer = EcdhKeyPair::generate();
        let key = derive_shared_key(Some(&peer.public_key()[..]));
        assert_eq!(key.len(), 16);
    }
}
