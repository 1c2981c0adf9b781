use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use log::debug;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::envelope::{EncryptionEnvelope, PassphraseLayer};
use crate::error::{Result, TransferError};
use crate::keyring::{KeyPair, PublicKeyHandle};
use crate::{AES_KEY_SIZE, NONCE_SIZE, PBKDF2_ROUNDS, RSA_DIRECT_LIMIT, SALT_SIZE};

pub type SymmetricKey = Zeroizing<[u8; AES_KEY_SIZE]>;

/// Fresh random bytes from the thread-local CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

pub fn generate_symmetric_key() -> SymmetricKey {
    Zeroizing::new(random_bytes::<AES_KEY_SIZE>())
}

/// PBKDF2-HMAC-SHA256 over the passphrase, 256-bit output.
pub fn derive_passphrase_key(passphrase: &str, salt: &[u8; SALT_SIZE]) -> SymmetricKey {
    let mut key = Zeroizing::new([0u8; AES_KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key[..]);
    key
}

pub fn encrypt_chunk(
    key: &[u8; AES_KEY_SIZE],
    chunk: &[u8],
    nonce_bytes: &[u8; NONCE_SIZE],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .encrypt(nonce, chunk)
        .map_err(|e| TransferError::Encryption(e.to_string()))
}

/// The GCM tag is checked before anything is returned; tampered input never yields
/// plaintext.
pub fn decrypt_chunk(
    key: &[u8; AES_KEY_SIZE],
    encrypted_chunk: &[u8],
    nonce_bytes: &[u8; NONCE_SIZE],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, encrypted_chunk)
        .map_err(|_| TransferError::Decryption)
}

/// Seal `payload` for the holder of `recipient`'s private key.
///
/// With a passphrase the payload is first wrapped under a PBKDF2-derived key. The
/// (possibly wrapped) bytes go straight under RSA-OAEP when they are at most
/// [`RSA_DIRECT_LIMIT`] bytes, otherwise under a one-time AES-256-GCM key that is
/// itself wrapped with RSA-OAEP. The limit does not grow with larger keys.
pub fn encrypt(
    payload: &[u8],
    recipient: &PublicKeyHandle,
    passphrase: Option<&str>,
) -> Result<EncryptionEnvelope> {
    let (inner, layer) = match passphrase {
        Some(passphrase) => {
            let layer = PassphraseLayer {
                salt: random_bytes::<SALT_SIZE>(),
                iv: random_bytes::<NONCE_SIZE>(),
            };
            let key = derive_passphrase_key(passphrase, &layer.salt);
            let wrapped = encrypt_chunk(&key, payload, &layer.iv)?;
            (Zeroizing::new(wrapped), Some(layer))
        }
        None => (Zeroizing::new(payload.to_vec()), None),
    };

    let salt = layer.map(|l| l.salt.to_vec());
    let passphrase_iv = layer.map(|l| l.iv.to_vec());

    // import() refuses keys below 2048 bits, whose OAEP capacity is exactly the limit
    debug_assert!(RSA_DIRECT_LIMIT <= recipient.direct_capacity());

    if inner.len() <= RSA_DIRECT_LIMIT {
        debug!("Sealing {} bytes directly under RSA-OAEP", inner.len());
        let data = recipient.encrypt_oaep(&inner)?;
        return Ok(EncryptionEnvelope::Rsa { data, salt, passphrase_iv });
    }

    debug!("Sealing {} bytes under a one-time AES-256-GCM key", inner.len());
    let session_key = generate_symmetric_key();
    let iv = random_bytes::<NONCE_SIZE>();
    let encrypted_data = encrypt_chunk(&session_key, &inner, &iv)?;
    let encrypted_key = recipient.encrypt_oaep(&session_key[..])?;

    Ok(EncryptionEnvelope::Hybrid {
        encrypted_data,
        encrypted_key,
        iv: iv.to_vec(),
        salt,
        passphrase_iv,
    })
}

/// Open an envelope addressed to `keypair`.
///
/// Every failure, whichever layer it happens in, is the same
/// [`TransferError::Decryption`]. The envelope is only borrowed, so the call can be
/// repeated, for example with a different passphrase.
pub fn decrypt(
    envelope: &EncryptionEnvelope,
    keypair: &KeyPair,
    passphrase: Option<&str>,
) -> Result<Vec<u8>> {
    let layer = envelope.passphrase_layer()?;

    let inner = match envelope {
        EncryptionEnvelope::Rsa { data, .. } => keypair.decrypt_oaep(data)?,
        EncryptionEnvelope::Hybrid { encrypted_data, encrypted_key, iv, .. } => {
            let unwrapped = keypair.decrypt_oaep(encrypted_key)?;
            let session_key: SymmetricKey = Zeroizing::new(
                unwrapped.as_slice().try_into().map_err(|_| TransferError::Decryption)?,
            );
            let iv: &[u8; NONCE_SIZE] =
                iv.as_slice().try_into().map_err(|_| TransferError::Decryption)?;
            Zeroizing::new(decrypt_chunk(&session_key, encrypted_data, iv)?)
        }
    };

    match (layer, passphrase) {
        (None, None) => Ok(inner.to_vec()),
        (Some(layer), Some(passphrase)) => {
            let key = derive_passphrase_key(passphrase, &layer.salt);
            decrypt_chunk(&key, &inner, &layer.iv)
        }
        _ => Err(TransferError::Decryption),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::tests::{second_keypair, shared_keypair};
    use crate::ENCRYPTION_OVERHEAD;

    fn recipient() -> PublicKeyHandle {
        shared_keypair().public_handle()
    }

    /// Pull the one-time AES key back out of a hybrid envelope.
    fn unwrap_session_key(envelope: &EncryptionEnvelope) -> Vec<u8> {
        match envelope {
            EncryptionEnvelope::Hybrid { encrypted_key, .. } => {
                shared_keypair().decrypt_oaep(encrypted_key).unwrap().to_vec()
            }
            other => panic!("expected hybrid envelope, got {}", other.kind()),
        }
    }

    #[test]
    fn test_chunk_roundtrip() {
        let key = generate_symmetric_key();
        let nonce = random_bytes::<NONCE_SIZE>();

        let encrypted = encrypt_chunk(&key, b"chunk of file data", &nonce).unwrap();
        assert_eq!(encrypted.len(), 18 + ENCRYPTION_OVERHEAD);

        let decrypted = decrypt_chunk(&key, &encrypted, &nonce).unwrap();
        assert_eq!(decrypted, b"chunk of file data");
    }

    #[test]
    fn test_chunk_wrong_nonce_fails() {
        let key = generate_symmetric_key();
        let encrypted = encrypt_chunk(&key, b"data", &[0u8; NONCE_SIZE]).unwrap();

        let result = decrypt_chunk(&key, &encrypted, &[1u8; NONCE_SIZE]);
        assert!(matches!(result, Err(TransferError::Decryption)));
    }

    #[test]
    fn test_derive_passphrase_key_deterministic() {
        let salt = [0x42u8; SALT_SIZE];
        let k1 = derive_passphrase_key("correct-horse", &salt);
        let k2 = derive_passphrase_key("correct-horse", &salt);
        let k3 = derive_passphrase_key("wrong-horse", &salt);

        assert_eq!(*k1, *k2);
        assert_ne!(*k1, *k3);
    }

    #[test]
    fn test_small_payload_uses_rsa() {
        let payload = vec![0xAB; 190];
        let envelope = encrypt(&payload, &recipient(), None).unwrap();

        assert_eq!(envelope.kind(), "rsa");
        assert_eq!(decrypt(&envelope, shared_keypair(), None).unwrap(), payload);
    }

    #[test]
    fn test_payload_over_capacity_uses_hybrid() {
        let payload = vec![0xCD; 191];
        let envelope = encrypt(&payload, &recipient(), None).unwrap();

        assert_eq!(envelope.kind(), "hybrid");
        assert_eq!(decrypt(&envelope, shared_keypair(), None).unwrap(), payload);
    }

    #[test]
    fn test_threshold_is_fixed_for_larger_keys() {
        let large = KeyPair::generate_with_bits(3072).unwrap();
        let handle = large.public_handle();
        assert_eq!(handle.direct_capacity(), 318);

        let envelope = encrypt(&[0x11; 191], &handle, None).unwrap();
        assert_eq!(envelope.kind(), "hybrid");
        assert_eq!(decrypt(&envelope, &large, None).unwrap(), vec![0x11; 191]);

        let envelope = encrypt(&[0x22; 300], &handle, None).unwrap();
        assert_eq!(envelope.kind(), "hybrid");

        let envelope = encrypt(&[0x33; RSA_DIRECT_LIMIT], &handle, None).unwrap();
        assert_eq!(envelope.kind(), "rsa");
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let envelope = encrypt(&[], &recipient(), None).unwrap();
        assert_eq!(envelope.kind(), "rsa");
        assert!(decrypt(&envelope, shared_keypair(), None).unwrap().is_empty());
    }

    #[test]
    fn test_passphrase_wrapping_counts_toward_threshold() {
        // 180 bytes plus the 16 byte GCM tag no longer fits under RSA.
        let payload = vec![1u8; 180];
        let envelope = encrypt(&payload, &recipient(), Some("pw")).unwrap();
        assert_eq!(envelope.kind(), "hybrid");
        assert!(envelope.has_passphrase_layer());

        let small = vec![1u8; 190 - ENCRYPTION_OVERHEAD];
        let envelope = encrypt(&small, &recipient(), Some("pw")).unwrap();
        assert_eq!(envelope.kind(), "rsa");
        assert_eq!(decrypt(&envelope, shared_keypair(), Some("pw")).unwrap(), small);
    }

    #[test]
    fn test_passphrase_roundtrip_hybrid() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let envelope = encrypt(&payload, &recipient(), Some("correct-horse")).unwrap();

        let decrypted = decrypt(&envelope, shared_keypair(), Some("correct-horse")).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_fresh_randomness_per_call() {
        let payload = vec![7u8; 1024];
        let a = encrypt(&payload, &recipient(), Some("pw")).unwrap();
        let b = encrypt(&payload, &recipient(), Some("pw")).unwrap();

        match (&a, &b) {
            (
                EncryptionEnvelope::Hybrid { iv: iv_a, salt: salt_a, passphrase_iv: piv_a, encrypted_data: d_a, .. },
                EncryptionEnvelope::Hybrid { iv: iv_b, salt: salt_b, passphrase_iv: piv_b, encrypted_data: d_b, .. },
            ) => {
                assert_ne!(iv_a, iv_b);
                assert_ne!(salt_a, salt_b);
                assert_ne!(piv_a, piv_b);
                assert_ne!(d_a, d_b);
            }
            _ => panic!("expected hybrid envelopes"),
        }

        assert_ne!(unwrap_session_key(&a), unwrap_session_key(&b));
    }

    #[test]
    fn test_rsa_envelopes_differ_per_call() {
        let a = encrypt(b"same", &recipient(), None).unwrap();
        let b = encrypt(b"same", &recipient(), None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_hybrid_data_fails() {
        let payload = vec![3u8; 600];
        let envelope = encrypt(&payload, &recipient(), None).unwrap();

        let EncryptionEnvelope::Hybrid { encrypted_data, .. } = &envelope else {
            panic!("expected hybrid envelope");
        };

        for index in [0, encrypted_data.len() / 2, encrypted_data.len() - 1] {
            let mut tampered = envelope.clone();
            if let EncryptionEnvelope::Hybrid { encrypted_data, .. } = &mut tampered {
                encrypted_data[index] ^= 0x01;
            }
            let result = decrypt(&tampered, shared_keypair(), None);
            assert!(matches!(result, Err(TransferError::Decryption)));
        }
    }

    #[test]
    fn test_tampered_rsa_data_fails() {
        let mut envelope = encrypt(b"short secret", &recipient(), None).unwrap();
        if let EncryptionEnvelope::Rsa { data, .. } = &mut envelope {
            data[10] ^= 0x80;
        }

        let result = decrypt(&envelope, shared_keypair(), None);
        assert!(matches!(result, Err(TransferError::Decryption)));
    }

    #[test]
    fn test_wrong_private_key_fails() {
        let envelope = encrypt(&[5u8; 300], &recipient(), None).unwrap();
        let result = decrypt(&envelope, second_keypair(), None);
        assert!(matches!(result, Err(TransferError::Decryption)));
    }

    #[test]
    fn test_wrong_passphrase_is_indistinguishable() {
        let envelope = encrypt(&[9u8; 400], &recipient(), Some("correct-horse")).unwrap();
        let wrong = decrypt(&envelope, shared_keypair(), Some("wrong-horse")).unwrap_err();

        let mut corrupted = envelope.clone();
        if let EncryptionEnvelope::Hybrid { encrypted_data, .. } = &mut corrupted {
            encrypted_data[0] ^= 0xFF;
        }
        let tampered = decrypt(&corrupted, shared_keypair(), Some("correct-horse")).unwrap_err();

        assert!(matches!(wrong, TransferError::Decryption));
        assert!(matches!(tampered, TransferError::Decryption));
        assert_eq!(wrong.to_string(), tampered.to_string());
    }

    #[test]
    fn test_passphrase_mismatch_in_either_direction_fails() {
        let plain = encrypt(&[1u8; 50], &recipient(), None).unwrap();
        assert!(matches!(
            decrypt(&plain, shared_keypair(), Some("unexpected")),
            Err(TransferError::Decryption)
        ));

        let wrapped = encrypt(&[1u8; 50], &recipient(), Some("needed")).unwrap();
        assert!(matches!(decrypt(&wrapped, shared_keypair(), None), Err(TransferError::Decryption)));
    }

    #[test]
    fn test_decrypt_is_repeatable() {
        let envelope = encrypt(&[4u8; 250], &recipient(), Some("pw")).unwrap();
        let snapshot = envelope.clone();

        let _ = decrypt(&envelope, shared_keypair(), Some("nope"));
        let first = decrypt(&envelope, shared_keypair(), Some("pw")).unwrap();
        let second = decrypt(&envelope, shared_keypair(), Some("pw")).unwrap();

        assert_eq!(first, second);
        assert_eq!(envelope, snapshot);
    }
}
