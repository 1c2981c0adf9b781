//! Per-session RSA keypair.
//!
//! A party generates exactly one [`KeyPair`] when it connects and publishes only the
//! PEM-encoded SPKI public half. The private key is only reachable through
//! crate-internal OAEP decryption; nothing serializes it.

use std::fmt;

use log::debug;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Result, TransferError};
use crate::RSA_KEY_BITS;

/// OAEP overhead for SHA-256: two hash lengths plus two bytes.
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

pub struct KeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyPair {
    /// Generate a fresh 2048-bit RSA keypair for OAEP/SHA-256.
    ///
    /// This takes noticeable wall time; async callers should run it on a blocking thread.
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(RSA_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        if bits < RSA_KEY_BITS {
            return Err(TransferError::KeyGeneration(format!(
                "modulus of {} bits is below the {} bit minimum",
                bits, RSA_KEY_BITS
            )));
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| TransferError::KeyGeneration(e.to_string()))?;
        let public_key = private_key.to_public_key();
        debug!("Generated {} bit RSA keypair", bits);

        Ok(KeyPair { private_key, public_key })
    }

    /// PEM (`-----BEGIN PUBLIC KEY-----`, 64 column base64) of the SPKI public key.
    pub fn export_public(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| TransferError::KeyGeneration(e.to_string()))
    }

    /// Encrypt-only handle to our own public key.
    pub fn public_handle(&self) -> PublicKeyHandle {
        PublicKeyHandle { key: self.public_key.clone() }
    }

    /// Every failure collapses into the generic decryption error.
    pub(crate) fn decrypt_oaep(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| TransferError::Decryption)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("bits", &(self.public_key.size() * 8))
            .finish_non_exhaustive()
    }
}

/// A peer's public key, usable only for encryption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyHandle {
    key: RsaPublicKey,
}

impl PublicKeyHandle {
    /// Parse a PEM-encoded SPKI RSA public key received from the relay.
    pub fn import(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem.trim())
            .map_err(|e| TransferError::KeyImport(e.to_string()))?;

        if key.size() * 8 < RSA_KEY_BITS {
            return Err(TransferError::KeyImport(format!(
                "{} bit modulus is too small",
                key.size() * 8
            )));
        }

        Ok(PublicKeyHandle { key })
    }

    /// Largest plaintext OAEP/SHA-256 could encrypt directly under this key
    /// (190 bytes for a 2048-bit modulus). Envelope selection uses the fixed
    /// `RSA_DIRECT_LIMIT` instead.
    pub fn direct_capacity(&self) -> usize {
        self.key.size() - OAEP_SHA256_OVERHEAD
    }

    pub fn export(&self) -> Result<String> {
        self.key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| TransferError::KeyImport(e.to_string()))
    }

    pub(crate) fn encrypt_oaep(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| TransferError::Encryption(e.to_string()))
    }
}
